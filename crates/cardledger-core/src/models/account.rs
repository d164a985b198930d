//! Account model
//!
//! One account per user. The spendable balance lives here and is only ever
//! changed through a `LedgerStore`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    #[default]
    Active,
    Banned,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "ACTIVE"),
            AccountStatus::Banned => write!(f, "BANNED"),
        }
    }
}

impl AccountStatus {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Some(AccountStatus::Active),
            "BANNED" => Some(AccountStatus::Banned),
            _ => None,
        }
    }
}

/// Account entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique identifier
    pub id: i64,

    /// Spendable balance, never negative outside an in-flight mutation
    pub balance: Decimal,

    /// Lifecycle status
    pub status: AccountStatus,

    /// Where notifications for this account are delivered (chat id, webhook, ...)
    pub notification_endpoint: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Check if the balance covers `amount`
    #[inline]
    pub fn can_cover(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

impl Default for Account {
    fn default() -> Self {
        Self {
            id: 0,
            balance: Decimal::ZERO,
            status: AccountStatus::Active,
            notification_endpoint: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
