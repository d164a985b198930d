//! Authorization request and decision records
//!
//! A decline is an expected business result, not an error. The decision
//! carries the internal reason so callers can tell outcomes apart without
//! parsing messages; the reason is not part of the wire format.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A proposed card charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub card_id: i64,
    pub amount: Decimal,
    pub merchant_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionStatus {
    Approved,
    Declined,
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionStatus::Approved => write!(f, "APPROVED"),
            DecisionStatus::Declined => write!(f, "DECLINED"),
        }
    }
}

/// Why an authorization was declined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    CardNotFound,
    AccountNotFound,
    /// Failure counter reached the threshold; the card is now blocked
    FraudBlocked,
    CardInactive,
    InsufficientBalance,
    DailyLimitExceeded,
    /// The atomic capture failed after all checks passed
    CaptureFailed,
}

impl DeclineReason {
    pub fn message(&self) -> &'static str {
        match self {
            DeclineReason::CardNotFound => "Card not found.",
            DeclineReason::AccountNotFound => "Account not found.",
            DeclineReason::FraudBlocked => "Card blocked due to multiple failed attempts.",
            DeclineReason::CardInactive => "Card is blocked or inactive.",
            DeclineReason::InsufficientBalance => "Insufficient user balance.",
            DeclineReason::DailyLimitExceeded => "Daily spend limit exceeded.",
            DeclineReason::CaptureFailed => "Internal system error during payment processing.",
        }
    }
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Outcome of an authorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub success: bool,
    pub status: DecisionStatus,
    pub message: String,
    pub fee: Decimal,
    #[serde(skip)]
    pub reason: Option<DeclineReason>,
}

impl AuthorizationDecision {
    pub const APPROVED_MESSAGE: &'static str = "Transaction approved.";

    pub fn approved(fee: Decimal) -> Self {
        Self {
            success: true,
            status: DecisionStatus::Approved,
            message: Self::APPROVED_MESSAGE.to_string(),
            fee,
            reason: None,
        }
    }

    pub fn declined(reason: DeclineReason, fee: Decimal) -> Self {
        Self {
            success: false,
            status: DecisionStatus::Declined,
            message: reason.message().to_string(),
            fee,
            reason: Some(reason),
        }
    }

    #[inline]
    pub fn is_approved(&self) -> bool {
        self.success
    }
}
