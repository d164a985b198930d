//! Storage and collaborator abstractions
//!
//! Every component receives its handles at construction; nothing reaches
//! for ambient global state.

use crate::models::{
    Account, Card, CardTransfer, GradeRecord, LedgerEntry, LedgerMutation, Referral,
};
use crate::AppResult;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// The single choke point for balance mutation
///
/// Every mutating method runs under an exclusive lock on the owning account
/// and either fully applies or leaves state untouched. An `Err` always means
/// "nothing changed". Waiting longer than the configured lock timeout yields
/// `AppError::LockTimeout`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ==================== Queries ====================

    async fn find_account(&self, account_id: i64) -> AppResult<Option<Account>>;

    async fn find_card(&self, card_id: i64) -> AppResult<Option<Card>>;

    /// Resolve a card by its id at the issuing provider
    async fn find_card_by_provider_id(&self, provider_card_id: &str) -> AppResult<Option<Card>>;

    /// Check whether an entry with this provider transaction id exists
    async fn provider_tx_exists(&self, provider_tx_id: &str) -> AppResult<bool>;

    /// Active cards with replenishment enabled and balance at or below threshold
    async fn cards_needing_replenishment(&self) -> AppResult<Vec<Card>>;

    /// Active cards that carry a provider reference
    async fn cards_with_provider_ref(&self) -> AppResult<Vec<Card>>;

    /// Entries of an account, oldest first
    async fn entries_for_account(&self, account_id: i64) -> AppResult<Vec<LedgerEntry>>;

    /// Sum of approved capture amounts of an account, as a positive value
    async fn total_spent(&self, account_id: i64) -> AppResult<Decimal>;

    // ==================== Atomic mutations ====================

    /// Apply `delta - fee` to an account balance and append one entry.
    ///
    /// Fails with `InsufficientBalance` if the result would be negative and
    /// with `DuplicateProviderTransaction` if the provider id is already
    /// recorded. A capture also resets the card's failure counter. Returns
    /// the new account balance.
    async fn apply(&self, mutation: LedgerMutation) -> AppResult<Decimal>;

    /// Change a card-local balance; the result may not go negative
    async fn apply_card_balance(&self, card_id: i64, delta: Decimal) -> AppResult<Decimal>;

    /// Overwrite a card-local balance with a provider-reported value
    async fn sync_card_balance(&self, card_id: i64, balance: Decimal) -> AppResult<Decimal>;

    /// Debit the owning account and credit the card, recorded as one FUND entry
    async fn transfer_to_card(
        &self,
        card_id: i64,
        amount: Decimal,
        detail: &str,
    ) -> AppResult<CardTransfer>;

    /// Bump the consecutive failure counter; returns the new count
    async fn increment_failed_auth(&self, card_id: i64) -> AppResult<i32>;

    /// Transition a card to BLOCKED
    async fn block_card(&self, card_id: i64) -> AppResult<()>;
}

/// Grade record persistence
#[async_trait]
pub trait GradeRepository: Send + Sync {
    async fn find_grade(&self, account_id: i64) -> AppResult<Option<GradeRecord>>;

    /// Insert or replace the record of `record.account_id` unless the stored
    /// record already covers a larger `total_spent`. Returns whether it was written.
    async fn save_grade(&self, record: &GradeRecord) -> AppResult<bool>;
}

/// Referral relationships and commission crediting
#[async_trait]
pub trait ReferralRepository: Send + Sync {
    async fn find_referral(&self, referral_id: i64) -> AppResult<Option<Referral>>;

    /// The active referral whose referred account is `referred_id`
    async fn find_active_referral_for(&self, referred_id: i64) -> AppResult<Option<Referral>>;

    /// Credit the referrer, append a REFERRAL_REVENUE entry and bump
    /// `commission_earned` in one atomic unit. Returns the referrer's new
    /// balance.
    async fn credit_referral(
        &self,
        referral_id: i64,
        commission: Decimal,
        detail: &str,
    ) -> AppResult<Decimal>;
}

/// Outbound message delivery to an account's endpoint
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, endpoint: &str, message: &str) -> AppResult<()>;
}

/// Card-issuing provider API
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Current balance of a card as the provider sees it
    async fn card_balance(&self, provider_card_id: &str) -> AppResult<Decimal>;
}
