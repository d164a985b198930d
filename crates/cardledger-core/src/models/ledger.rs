//! Ledger entry model
//!
//! Entries are append-only. Amounts are signed: debits are negative,
//! credits positive. The fee is stored separately and is always charged on
//! top of the amount.

use super::Card;
use crate::{AppError, AppResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// Account funding or account-to-card transfer
    Fund,
    /// Approved card spend
    Capture,
    /// Provider refund or reversal
    Refund,
    /// Commission credited to a referrer
    ReferralRevenue,
    Fee,
    Adjustment,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Fund => write!(f, "FUND"),
            EntryType::Capture => write!(f, "CAPTURE"),
            EntryType::Refund => write!(f, "REFUND"),
            EntryType::ReferralRevenue => write!(f, "REFERRAL_REVENUE"),
            EntryType::Fee => write!(f, "FEE"),
            EntryType::Adjustment => write!(f, "ADJUSTMENT"),
        }
    }
}

impl EntryType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "FUND" => Some(EntryType::Fund),
            "CAPTURE" => Some(EntryType::Capture),
            "REFUND" => Some(EntryType::Refund),
            "REFERRAL_REVENUE" => Some(EntryType::ReferralRevenue),
            "FEE" => Some(EntryType::Fee),
            "ADJUSTMENT" => Some(EntryType::Adjustment),
            _ => None,
        }
    }
}

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    #[default]
    Approved,
    Declined,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Approved => write!(f, "APPROVED"),
            EntryStatus::Declined => write!(f, "DECLINED"),
        }
    }
}

impl EntryStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "APPROVED" => Some(EntryStatus::Approved),
            "DECLINED" => Some(EntryStatus::Declined),
            _ => None,
        }
    }
}

/// Immutable record of one balance-affecting event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: i64,
    pub card_id: Option<i64>,

    /// Signed amount applied to the account, excluding the fee
    pub amount: Decimal,

    /// Fee charged on top of `amount`
    pub fee: Decimal,

    pub entry_type: EntryType,
    pub status: EntryStatus,

    /// Free-text detail (merchant, reason, ...)
    pub detail: String,

    /// Provider transaction id, the dedup key for webhooks
    pub provider_tx_id: Option<String>,

    /// Account balance right after this entry
    pub balance_after: Decimal,

    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Net effect of this entry on the account balance
    pub fn net_effect(&self) -> Decimal {
        self.amount - self.fee
    }

    /// Whether this entry counts toward the grade spend total
    pub fn is_approved_capture(&self) -> bool {
        self.entry_type == EntryType::Capture && self.status == EntryStatus::Approved
    }
}

/// Input to `LedgerStore::apply`
///
/// Built with the constructors below so the sign convention stays in one
/// place.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerMutation {
    pub account_id: i64,
    /// Signed balance change before the fee
    pub delta: Decimal,
    pub fee: Decimal,
    pub entry_type: EntryType,
    pub detail: String,
    pub card_id: Option<i64>,
    pub provider_tx_id: Option<String>,
    /// Failed-attempt limit of a card-present charge. When set, the card is
    /// re-checked under the ledger lock and its failure counter is reset on
    /// success.
    pub fraud_threshold: Option<i32>,
}

impl LedgerMutation {
    pub fn new(account_id: i64, delta: Decimal, entry_type: EntryType, detail: impl Into<String>) -> Self {
        Self {
            account_id,
            delta,
            fee: Decimal::ZERO,
            entry_type,
            detail: detail.into(),
            card_id: None,
            provider_tx_id: None,
            fraud_threshold: None,
        }
    }

    /// Card spend: debits `amount` and charges `fee`
    pub fn capture(account_id: i64, card_id: i64, amount: Decimal, fee: Decimal, detail: impl Into<String>) -> Self {
        Self::new(account_id, -amount, EntryType::Capture, detail)
            .with_fee(fee)
            .with_card(card_id)
    }

    /// Provider refund or reversal: credits `amount`
    pub fn refund(account_id: i64, card_id: i64, amount: Decimal, detail: impl Into<String>) -> Self {
        Self::new(account_id, amount, EntryType::Refund, detail).with_card(card_id)
    }

    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    pub fn with_card(mut self, card_id: i64) -> Self {
        self.card_id = Some(card_id);
        self
    }

    pub fn with_provider_tx(mut self, provider_tx_id: impl Into<String>) -> Self {
        self.provider_tx_id = Some(provider_tx_id.into());
        self
    }

    /// Require an ACTIVE card below `threshold` failures at capture time
    pub fn with_fraud_threshold(mut self, threshold: i32) -> Self {
        self.fraud_threshold = Some(threshold);
        self
    }

    /// Re-check the card of a guarded capture; unguarded mutations always pass
    pub fn check_card(&self, card: &Card) -> AppResult<()> {
        let Some(threshold) = self.fraud_threshold else {
            return Ok(());
        };

        if card.failed_auth_count >= threshold {
            return Err(AppError::FraudThresholdReached(card.id));
        }
        if !card.is_active() {
            return Err(AppError::CardNotActive(card.id));
        }
        Ok(())
    }

    /// Total change applied to the balance
    pub fn net_delta(&self) -> Decimal {
        self.delta - self.fee
    }
}

/// Result of an atomic account-to-card transfer
#[derive(Debug, Clone, PartialEq)]
pub struct CardTransfer {
    pub account_balance: Decimal,
    pub card_balance: Decimal,
    pub entry_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_capture_mutation_signs() {
        let m = LedgerMutation::capture(1, 2, dec!(50.00), dec!(3.35), "Shop")
            .with_provider_tx("tx-1");

        assert_eq!(m.delta, dec!(-50.00));
        assert_eq!(m.net_delta(), dec!(-53.35));
        assert_eq!(m.entry_type, EntryType::Capture);
        assert_eq!(m.card_id, Some(2));
        assert_eq!(m.provider_tx_id.as_deref(), Some("tx-1"));
    }

    #[test]
    fn test_refund_mutation_credits() {
        let m = LedgerMutation::refund(1, 2, dec!(12.50), "Refund");
        assert_eq!(m.net_delta(), dec!(12.50));
        assert_eq!(m.fee, Decimal::ZERO);
    }

    #[test]
    fn test_card_guard() {
        let card = Card {
            id: 2,
            account_id: 1,
            ..Default::default()
        };
        let unguarded = LedgerMutation::capture(1, 2, dec!(5), dec!(0), "Shop");
        let guarded = unguarded.clone().with_fraud_threshold(3);

        assert!(guarded.check_card(&card).is_ok());

        let tripped = Card {
            failed_auth_count: 3,
            ..card.clone()
        };
        assert!(matches!(
            guarded.check_card(&tripped),
            Err(AppError::FraudThresholdReached(2))
        ));
        assert!(unguarded.check_card(&tripped).is_ok());

        let frozen = Card {
            status: crate::models::CardStatus::Frozen,
            ..card
        };
        assert!(matches!(
            guarded.check_card(&frozen),
            Err(AppError::CardNotActive(2))
        ));
    }

    #[test]
    fn test_entry_type_roundtrip_names() {
        assert_eq!(EntryType::ReferralRevenue.to_string(), "REFERRAL_REVENUE");
        assert_eq!(EntryType::from_str("referral_revenue"), Some(EntryType::ReferralRevenue));
        assert_eq!(EntryType::from_str("bogus"), None);
    }
}
