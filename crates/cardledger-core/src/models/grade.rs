//! Discount grade model
//!
//! Grades are ordered from the most expensive (Standard) to the cheapest
//! (Black). The record is derived from ledger history and never edited by
//! hand.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Grade {
    #[default]
    Standard,
    Silver,
    Gold,
    Platinum,
    Black,
}

impl Grade {
    /// All grades in ascending threshold order
    pub const ALL: [Grade; 5] = [
        Grade::Standard,
        Grade::Silver,
        Grade::Gold,
        Grade::Platinum,
        Grade::Black,
    ];

    /// Minimum cumulative spend to reach this grade
    pub fn threshold(&self) -> Decimal {
        match self {
            Grade::Standard => Decimal::ZERO,
            Grade::Silver => Decimal::from(1_000),
            Grade::Gold => Decimal::from(10_000),
            Grade::Platinum => Decimal::from(50_000),
            Grade::Black => Decimal::from(100_000),
        }
    }

    /// Fee percentage charged on captures
    pub fn fee_percent(&self) -> Decimal {
        match self {
            Grade::Standard => Decimal::new(670, 2),
            Grade::Silver => Decimal::new(600, 2),
            Grade::Gold => Decimal::new(500, 2),
            Grade::Platinum => Decimal::new(400, 2),
            Grade::Black => Decimal::new(300, 2),
        }
    }

    /// The next grade up, `None` at the top
    pub fn next(&self) -> Option<Grade> {
        match self {
            Grade::Standard => Some(Grade::Silver),
            Grade::Silver => Some(Grade::Gold),
            Grade::Gold => Some(Grade::Platinum),
            Grade::Platinum => Some(Grade::Black),
            Grade::Black => None,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "STANDARD" => Some(Grade::Standard),
            "SILVER" => Some(Grade::Silver),
            "GOLD" => Some(Grade::Gold),
            "PLATINUM" => Some(Grade::Platinum),
            "BLACK" => Some(Grade::Black),
            _ => None,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grade::Standard => write!(f, "STANDARD"),
            Grade::Silver => write!(f, "SILVER"),
            Grade::Gold => write!(f, "GOLD"),
            Grade::Platinum => write!(f, "PLATINUM"),
            Grade::Black => write!(f, "BLACK"),
        }
    }
}

/// Persisted grade of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub account_id: i64,
    pub total_spent: Decimal,
    pub grade: Grade,
    pub fee_percent: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Grade summary with progress toward the next level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeInfo {
    pub grade: Grade,
    pub fee_percent: Decimal,
    pub total_spent: Decimal,
    pub next_grade: Option<Grade>,
    /// Spend still needed to reach `next_grade`
    pub remaining_to_next: Option<Decimal>,
}
