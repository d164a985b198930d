//! Card model
//!
//! A spending instrument tied to one account. Carries its own local
//! balance, the anti-fraud counter and the auto-replenishment policy.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Card status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CardStatus {
    #[default]
    Active,
    /// Blocked by the anti-fraud guard or an administrator
    Blocked,
    Frozen,
    Closed,
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardStatus::Active => write!(f, "ACTIVE"),
            CardStatus::Blocked => write!(f, "BLOCKED"),
            CardStatus::Frozen => write!(f, "FROZEN"),
            CardStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

impl CardStatus {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Some(CardStatus::Active),
            "BLOCKED" => Some(CardStatus::Blocked),
            "FROZEN" => Some(CardStatus::Frozen),
            "CLOSED" => Some(CardStatus::Closed),
            _ => None,
        }
    }
}

/// Auto-replenishment settings embedded in a card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplenishmentPolicy {
    pub enabled: bool,
    /// Top up when the card balance is at or below this value
    pub threshold: Decimal,
    /// Amount moved from the account on each top-up
    pub amount: Decimal,
}

/// Card entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,

    /// Owning account
    pub account_id: i64,

    pub status: CardStatus,

    /// Consecutive failed authorizations, reset on every approval
    pub failed_auth_count: i32,

    /// Per-transaction spend cap; zero or absent means unlimited
    pub daily_spend_limit: Option<Decimal>,

    /// Card-local balance as funded by replenishment or reported by the provider
    pub card_balance: Decimal,

    pub replenishment: ReplenishmentPolicy,

    /// Card id at the issuing provider
    pub provider_card_id: Option<String>,

    /// Masked card number
    pub masked_number: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Card {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == CardStatus::Active
    }

    /// Check if the card should be topped up by the scheduler
    pub fn needs_replenishment(&self) -> bool {
        self.replenishment.enabled
            && self.is_active()
            && self.card_balance <= self.replenishment.threshold
    }

    /// Check a charge against the configured spend limit
    pub fn exceeds_limit(&self, amount: Decimal) -> bool {
        match self.daily_spend_limit {
            Some(limit) if limit > Decimal::ZERO => amount > limit,
            _ => false,
        }
    }

    /// Last four digits of the card number, `****` when unknown
    pub fn last4(&self) -> String {
        self.masked_number
            .as_deref()
            .filter(|n| n.len() >= 4)
            .map(|n| n[n.len() - 4..].to_string())
            .unwrap_or_else(|| "****".to_string())
    }
}

impl Default for Card {
    fn default() -> Self {
        Self {
            id: 0,
            account_id: 0,
            status: CardStatus::Active,
            failed_auth_count: 0,
            daily_spend_limit: None,
            card_balance: Decimal::ZERO,
            replenishment: ReplenishmentPolicy::default(),
            provider_card_id: None,
            masked_number: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_needs_replenishment() {
        let mut card = Card {
            card_balance: dec!(5.00),
            replenishment: ReplenishmentPolicy {
                enabled: true,
                threshold: dec!(10.00),
                amount: dec!(15.00),
            },
            ..Default::default()
        };
        assert!(card.needs_replenishment());

        card.card_balance = dec!(10.00);
        assert!(card.needs_replenishment());

        card.card_balance = dec!(10.01);
        assert!(!card.needs_replenishment());

        card.card_balance = dec!(1.00);
        card.status = CardStatus::Frozen;
        assert!(!card.needs_replenishment());
    }

    #[test]
    fn test_spend_limit() {
        let mut card = Card::default();
        assert!(!card.exceeds_limit(dec!(1000000)));

        card.daily_spend_limit = Some(Decimal::ZERO);
        assert!(!card.exceeds_limit(dec!(1000000)));

        card.daily_spend_limit = Some(dec!(100));
        assert!(!card.exceeds_limit(dec!(100)));
        assert!(card.exceeds_limit(dec!(100.01)));
    }

    #[test]
    fn test_last4() {
        let card = Card {
            masked_number: Some("4111 11** **** 1234".to_string()),
            ..Default::default()
        };
        assert_eq!(card.last4(), "1234");
        assert_eq!(Card::default().last4(), "****");
    }
}
