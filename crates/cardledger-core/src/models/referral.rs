//! Referral relationship model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReferralStatus {
    #[default]
    Active,
    Inactive,
}

impl fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferralStatus::Active => write!(f, "ACTIVE"),
            ReferralStatus::Inactive => write!(f, "INACTIVE"),
        }
    }
}

impl ReferralStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Some(ReferralStatus::Active),
            "INACTIVE" => Some(ReferralStatus::Inactive),
            _ => None,
        }
    }
}

/// A referrer/referred account pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: i64,
    /// Account that receives the commission
    pub referrer_id: i64,
    pub referred_id: i64,
    pub status: ReferralStatus,
    /// Running total of commission credited to the referrer
    pub commission_earned: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Default for Referral {
    fn default() -> Self {
        Self {
            id: 0,
            referrer_id: 0,
            referred_id: 0,
            status: ReferralStatus::Active,
            commission_earned: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }
}
