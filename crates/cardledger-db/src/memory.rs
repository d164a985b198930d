//! In-process ledger store
//!
//! Implements the same contract as the PostgreSQL store without a database:
//! each account has an async mutex acquired with a timeout, and all reads
//! and writes of one operation happen in a single critical section over the
//! shared state while that mutex is held. The provider transaction id set
//! lives in the same state, so duplicate detection and the write are one
//! step.

use async_trait::async_trait;
use cardledger_core::{
    models::{
        Account, Card, CardStatus, CardTransfer, EntryStatus, EntryType, GradeRecord,
        LedgerEntry, LedgerMutation, Referral, ReferralStatus,
    },
    traits::{GradeRepository, LedgerStore, ReferralRepository},
    AppError, AppResult,
};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

/// Default wait for an account lock
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    accounts: HashMap<i64, Account>,
    cards: HashMap<i64, Card>,
    entries: Vec<LedgerEntry>,
    provider_tx_ids: HashSet<String>,
    grades: HashMap<i64, GradeRecord>,
    referrals: HashMap<i64, Referral>,
    next_entry_id: i64,
}

impl State {
    fn append(&mut self, mutation: &LedgerMutation, balance_after: Decimal) -> i64 {
        self.next_entry_id += 1;
        let id = self.next_entry_id;

        if let Some(tx_id) = &mutation.provider_tx_id {
            self.provider_tx_ids.insert(tx_id.clone());
        }

        self.entries.push(LedgerEntry {
            id,
            account_id: mutation.account_id,
            card_id: mutation.card_id,
            amount: mutation.delta,
            fee: mutation.fee,
            entry_type: mutation.entry_type,
            status: EntryStatus::Approved,
            detail: mutation.detail.clone(),
            provider_tx_id: mutation.provider_tx_id.clone(),
            balance_after,
            created_at: Utc::now(),
        });

        id
    }

    fn account_mut(&mut self, account_id: i64) -> AppResult<&mut Account> {
        self.accounts
            .get_mut(&account_id)
            .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))
    }

    fn card_mut(&mut self, card_id: i64) -> AppResult<&mut Card> {
        self.cards
            .get_mut(&card_id)
            .ok_or_else(|| AppError::CardNotFound(card_id.to_string()))
    }
}

/// In-memory implementation of LedgerStore, GradeRepository and ReferralRepository
pub struct MemoryLedgerStore {
    state: Mutex<State>,
    account_locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    lock_timeout: Duration,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            account_locks: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    // ==================== Seeding ====================

    /// Register an account owned by the external user-management side
    pub fn insert_account(&self, account: Account) {
        self.state.lock().accounts.insert(account.id, account);
    }

    /// Register an issued card; its owner must exist
    pub fn insert_card(&self, card: Card) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.accounts.contains_key(&card.account_id) {
            return Err(AppError::AccountNotFound(card.account_id.to_string()));
        }
        state.cards.insert(card.id, card);
        Ok(())
    }

    pub fn insert_referral(&self, referral: Referral) -> AppResult<()> {
        let mut state = self.state.lock();
        for id in [referral.referrer_id, referral.referred_id] {
            if !state.accounts.contains_key(&id) {
                return Err(AppError::AccountNotFound(id.to_string()));
            }
        }
        state.referrals.insert(referral.id, referral);
        Ok(())
    }

    // ==================== Snapshots ====================

    pub fn account_balance(&self, account_id: i64) -> Option<Decimal> {
        self.state.lock().accounts.get(&account_id).map(|a| a.balance)
    }

    pub fn card_snapshot(&self, card_id: i64) -> Option<Card> {
        self.state.lock().cards.get(&card_id).cloned()
    }

    pub fn referral_snapshot(&self, referral_id: i64) -> Option<Referral> {
        self.state.lock().referrals.get(&referral_id).cloned()
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    // ==================== Locking ====================

    /// Acquire the exclusive lock of an account, waiting at most the
    /// configured timeout
    pub async fn lock_account(&self, account_id: i64) -> AppResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.account_locks.lock();
            locks
                .entry(account_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                warn!("Lock wait on account {} timed out", account_id);
                AppError::LockTimeout(account_id)
            })
    }

    fn owner_of(&self, card_id: i64) -> AppResult<i64> {
        self.state
            .lock()
            .cards
            .get(&card_id)
            .map(|c| c.account_id)
            .ok_or_else(|| AppError::CardNotFound(card_id.to_string()))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_account(&self, account_id: i64) -> AppResult<Option<Account>> {
        Ok(self.state.lock().accounts.get(&account_id).cloned())
    }

    async fn find_card(&self, card_id: i64) -> AppResult<Option<Card>> {
        Ok(self.card_snapshot(card_id))
    }

    async fn find_card_by_provider_id(&self, provider_card_id: &str) -> AppResult<Option<Card>> {
        Ok(self
            .state
            .lock()
            .cards
            .values()
            .find(|c| c.provider_card_id.as_deref() == Some(provider_card_id))
            .cloned())
    }

    async fn provider_tx_exists(&self, provider_tx_id: &str) -> AppResult<bool> {
        Ok(self.state.lock().provider_tx_ids.contains(provider_tx_id))
    }

    async fn cards_needing_replenishment(&self) -> AppResult<Vec<Card>> {
        let mut cards: Vec<Card> = self
            .state
            .lock()
            .cards
            .values()
            .filter(|c| c.needs_replenishment())
            .cloned()
            .collect();
        cards.sort_by_key(|c| c.id);
        Ok(cards)
    }

    async fn cards_with_provider_ref(&self) -> AppResult<Vec<Card>> {
        let mut cards: Vec<Card> = self
            .state
            .lock()
            .cards
            .values()
            .filter(|c| c.is_active() && c.provider_card_id.is_some())
            .cloned()
            .collect();
        cards.sort_by_key(|c| c.id);
        Ok(cards)
    }

    async fn entries_for_account(&self, account_id: i64) -> AppResult<Vec<LedgerEntry>> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn total_spent(&self, account_id: i64) -> AppResult<Decimal> {
        Ok(-self
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| e.account_id == account_id && e.is_approved_capture())
            .map(|e| e.amount)
            .sum::<Decimal>())
    }

    #[instrument(skip(self, mutation), fields(account_id = mutation.account_id, entry_type = %mutation.entry_type))]
    async fn apply(&self, mutation: LedgerMutation) -> AppResult<Decimal> {
        let _guard = self.lock_account(mutation.account_id).await?;
        let mut state = self.state.lock();

        if let Some(tx_id) = &mutation.provider_tx_id {
            if state.provider_tx_ids.contains(tx_id) {
                return Err(AppError::DuplicateProviderTransaction(tx_id.clone()));
            }
        }

        let guarded_card = match (mutation.fraud_threshold, mutation.card_id) {
            (Some(_), Some(card_id)) => {
                let card = state
                    .cards
                    .get(&card_id)
                    .filter(|c| c.account_id == mutation.account_id)
                    .ok_or_else(|| AppError::CardNotFound(card_id.to_string()))?;
                mutation.check_card(card)?;
                Some(card_id)
            }
            _ => None,
        };

        let account = state.account_mut(mutation.account_id)?;
        let new_balance = account.balance + mutation.net_delta();
        if new_balance < Decimal::ZERO {
            return Err(AppError::InsufficientBalance {
                required: (-mutation.net_delta()).to_string(),
                available: account.balance.to_string(),
            });
        }
        account.balance = new_balance;
        account.updated_at = Utc::now();

        if let Some(card) = guarded_card.and_then(|id| state.cards.get_mut(&id)) {
            card.failed_auth_count = 0;
        }

        let entry_id = state.append(&mutation, new_balance);

        debug!(
            "Applied {} entry {}: delta={} fee={} balance={}",
            mutation.entry_type, entry_id, mutation.delta, mutation.fee, new_balance
        );
        Ok(new_balance)
    }

    async fn apply_card_balance(&self, card_id: i64, delta: Decimal) -> AppResult<Decimal> {
        let owner = self.owner_of(card_id)?;
        let _guard = self.lock_account(owner).await?;
        let mut state = self.state.lock();

        let card = state.card_mut(card_id)?;
        let new_balance = card.card_balance + delta;
        if new_balance < Decimal::ZERO {
            return Err(AppError::InsufficientBalance {
                required: (-delta).to_string(),
                available: card.card_balance.to_string(),
            });
        }
        card.card_balance = new_balance;
        Ok(new_balance)
    }

    async fn sync_card_balance(&self, card_id: i64, balance: Decimal) -> AppResult<Decimal> {
        if balance < Decimal::ZERO {
            return Err(AppError::InvalidInput(format!(
                "Card balance cannot be negative: {}",
                balance
            )));
        }

        let owner = self.owner_of(card_id)?;
        let _guard = self.lock_account(owner).await?;
        let mut state = self.state.lock();

        let card = state.card_mut(card_id)?;
        card.card_balance = balance;
        Ok(balance)
    }

    #[instrument(skip(self, detail))]
    async fn transfer_to_card(
        &self,
        card_id: i64,
        amount: Decimal,
        detail: &str,
    ) -> AppResult<CardTransfer> {
        if amount <= Decimal::ZERO {
            return Err(AppError::InvalidInput(format!(
                "Transfer amount must be positive: {}",
                amount
            )));
        }

        let owner = self.owner_of(card_id)?;
        let _guard = self.lock_account(owner).await?;
        let mut state = self.state.lock();

        let account = state.account_mut(owner)?;
        if account.balance < amount {
            return Err(AppError::InsufficientBalance {
                required: amount.to_string(),
                available: account.balance.to_string(),
            });
        }
        account.balance -= amount;
        account.updated_at = Utc::now();
        let account_balance = account.balance;

        let card = state.card_mut(card_id)?;
        card.card_balance += amount;
        let card_balance = card.card_balance;

        let mutation = LedgerMutation::new(owner, -amount, EntryType::Fund, detail).with_card(card_id);
        let entry_id = state.append(&mutation, account_balance);

        info!(
            "Transferred {} from account {} to card {}",
            amount, owner, card_id
        );

        Ok(CardTransfer {
            account_balance,
            card_balance,
            entry_id,
        })
    }

    async fn increment_failed_auth(&self, card_id: i64) -> AppResult<i32> {
        let owner = self.owner_of(card_id)?;
        let _guard = self.lock_account(owner).await?;
        let mut state = self.state.lock();

        let card = state.card_mut(card_id)?;
        card.failed_auth_count += 1;
        Ok(card.failed_auth_count)
    }

    async fn block_card(&self, card_id: i64) -> AppResult<()> {
        let owner = self.owner_of(card_id)?;
        let _guard = self.lock_account(owner).await?;
        let mut state = self.state.lock();

        state.card_mut(card_id)?.status = CardStatus::Blocked;
        Ok(())
    }
}

#[async_trait]
impl GradeRepository for MemoryLedgerStore {
    async fn find_grade(&self, account_id: i64) -> AppResult<Option<GradeRecord>> {
        Ok(self.state.lock().grades.get(&account_id).cloned())
    }

    async fn save_grade(&self, record: &GradeRecord) -> AppResult<bool> {
        let mut state = self.state.lock();
        let stale = state
            .grades
            .get(&record.account_id)
            .is_some_and(|existing| existing.total_spent > record.total_spent);
        if stale {
            return Ok(false);
        }
        state.grades.insert(record.account_id, record.clone());
        Ok(true)
    }
}

#[async_trait]
impl ReferralRepository for MemoryLedgerStore {
    async fn find_referral(&self, referral_id: i64) -> AppResult<Option<Referral>> {
        Ok(self.referral_snapshot(referral_id))
    }

    async fn find_active_referral_for(&self, referred_id: i64) -> AppResult<Option<Referral>> {
        Ok(self
            .state
            .lock()
            .referrals
            .values()
            .filter(|r| r.referred_id == referred_id && r.status == ReferralStatus::Active)
            .min_by_key(|r| r.id)
            .cloned())
    }

    async fn credit_referral(
        &self,
        referral_id: i64,
        commission: Decimal,
        detail: &str,
    ) -> AppResult<Decimal> {
        let referrer_id = self
            .referral_snapshot(referral_id)
            .map(|r| r.referrer_id)
            .ok_or_else(|| AppError::ReferralNotFound(referral_id.to_string()))?;

        let _guard = self.lock_account(referrer_id).await?;
        let mut state = self.state.lock();

        let account = state.account_mut(referrer_id)?;
        account.balance += commission;
        account.updated_at = Utc::now();
        let new_balance = account.balance;

        if let Some(referral) = state.referrals.get_mut(&referral_id) {
            referral.commission_earned += commission;
        }

        let mutation =
            LedgerMutation::new(referrer_id, commission, EntryType::ReferralRevenue, detail);
        state.append(&mutation, new_balance);

        Ok(new_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardledger_core::models::ReplenishmentPolicy;
    use rust_decimal_macros::dec;

    fn store_with(balance: Decimal) -> MemoryLedgerStore {
        let store = MemoryLedgerStore::new();
        store.insert_account(Account {
            id: 1,
            balance,
            ..Default::default()
        });
        store
            .insert_card(Card {
                id: 10,
                account_id: 1,
                failed_auth_count: 2,
                provider_card_id: Some("ext-10".to_string()),
                ..Default::default()
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_capture_debits_amount_and_fee_and_resets_counter() {
        let store = store_with(dec!(100.00));

        let balance = store
            .apply(
                LedgerMutation::capture(1, 10, dec!(50.00), dec!(3.35), "Shop")
                    .with_fraud_threshold(3),
            )
            .await
            .unwrap();

        assert_eq!(balance, dec!(46.65));
        assert_eq!(store.card_snapshot(10).unwrap().failed_auth_count, 0);
        assert_eq!(store.total_spent(1).await.unwrap(), dec!(50.00));
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_unguarded_capture_keeps_counter() {
        let store = store_with(dec!(100.00));

        store
            .apply(LedgerMutation::capture(1, 10, dec!(10.00), dec!(0), "Settled"))
            .await
            .unwrap();

        assert_eq!(store.card_snapshot(10).unwrap().failed_auth_count, 2);
    }

    #[tokio::test]
    async fn test_guarded_capture_refuses_blocked_card() {
        let store = store_with(dec!(100.00));
        store.block_card(10).await.unwrap();

        let result = store
            .apply(
                LedgerMutation::capture(1, 10, dec!(50.00), dec!(3.35), "Shop")
                    .with_fraud_threshold(3),
            )
            .await;

        assert!(matches!(result, Err(AppError::CardNotActive(10))));
        assert_eq!(store.account_balance(1), Some(dec!(100.00)));
        assert_eq!(store.card_snapshot(10).unwrap().status, CardStatus::Blocked);
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_guarded_capture_refuses_tripped_card() {
        let store = store_with(dec!(100.00));
        store.increment_failed_auth(10).await.unwrap();

        let result = store
            .apply(
                LedgerMutation::capture(1, 10, dec!(50.00), dec!(3.35), "Shop")
                    .with_fraud_threshold(3),
            )
            .await;

        assert!(matches!(result, Err(AppError::FraudThresholdReached(10))));
        assert_eq!(store.card_snapshot(10).unwrap().failed_auth_count, 3);
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_grade_is_not_saved() {
        let store = MemoryLedgerStore::new();
        let newer = GradeRecord {
            account_id: 1,
            total_spent: dec!(1100),
            grade: cardledger_core::models::Grade::Silver,
            fee_percent: dec!(6.00),
            updated_at: Utc::now(),
        };
        let stale = GradeRecord {
            total_spent: dec!(500),
            grade: cardledger_core::models::Grade::Standard,
            fee_percent: dec!(6.70),
            ..newer.clone()
        };

        assert!(store.save_grade(&newer).await.unwrap());
        assert!(!store.save_grade(&stale).await.unwrap());
        assert_eq!(store.find_grade(1).await.unwrap(), Some(newer.clone()));
        // equal totals still refresh the timestamp
        assert!(store.save_grade(&newer).await.unwrap());
    }

    #[tokio::test]
    async fn test_overdraft_changes_nothing() {
        let store = store_with(dec!(100.00));

        let result = store
            .apply(LedgerMutation::capture(1, 10, dec!(100.00), dec!(0.01), "Shop"))
            .await;

        assert!(matches!(result, Err(AppError::InsufficientBalance { .. })));
        assert_eq!(store.account_balance(1), Some(dec!(100.00)));
        assert_eq!(store.card_snapshot(10).unwrap().failed_auth_count, 2);
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_provider_id_is_rejected() {
        let store = store_with(dec!(10.00));
        let refund = LedgerMutation::refund(1, 10, dec!(5.00), "Refund").with_provider_tx("tx-9");

        store.apply(refund.clone()).await.unwrap();
        let second = store.apply(refund).await;

        assert!(matches!(second, Err(AppError::DuplicateProviderTransaction(id)) if id == "tx-9"));
        assert_eq!(store.account_balance(1), Some(dec!(15.00)));
        assert!(store.provider_tx_exists("tx-9").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_timeout_is_explicit() {
        let store = MemoryLedgerStore::with_lock_timeout(Duration::from_millis(20));
        store.insert_account(Account {
            id: 1,
            balance: dec!(10.00),
            ..Default::default()
        });

        let _held = store.lock_account(1).await.unwrap();
        let result = store
            .apply(LedgerMutation::new(1, dec!(1), EntryType::Adjustment, "t"))
            .await;

        assert!(matches!(result, Err(AppError::LockTimeout(1))));
        assert_eq!(store.account_balance(1), Some(dec!(10.00)));
    }

    #[tokio::test]
    async fn test_transfer_to_card_is_one_fund_entry() {
        let store = store_with(dec!(20.00));

        let transfer = store.transfer_to_card(10, dec!(15.00), "Auto top-up").await.unwrap();

        assert_eq!(transfer.account_balance, dec!(5.00));
        assert_eq!(transfer.card_balance, dec!(15.00));
        let entries = store.entries_for_account(1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::Fund);
        assert_eq!(entries[0].card_id, Some(10));
    }

    #[tokio::test]
    async fn test_card_balance_primitives() {
        let store = store_with(dec!(0));

        assert_eq!(store.apply_card_balance(10, dec!(7.50)).await.unwrap(), dec!(7.50));
        assert!(store.apply_card_balance(10, dec!(-8.00)).await.is_err());
        assert_eq!(store.sync_card_balance(10, dec!(3.00)).await.unwrap(), dec!(3.00));
        assert!(matches!(
            store.sync_card_balance(10, dec!(-1)).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            store.sync_card_balance(99, dec!(1)).await,
            Err(AppError::CardNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replenishment_query() {
        let store = store_with(dec!(0));
        store
            .insert_card(Card {
                id: 11,
                account_id: 1,
                card_balance: dec!(5.00),
                replenishment: ReplenishmentPolicy {
                    enabled: true,
                    threshold: dec!(10.00),
                    amount: dec!(15.00),
                },
                ..Default::default()
            })
            .unwrap();

        let due = store.cards_needing_replenishment().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, 11);
    }

    #[tokio::test]
    async fn test_card_for_unknown_account_is_rejected() {
        let store = MemoryLedgerStore::new();
        let result = store.insert_card(Card {
            id: 1,
            account_id: 42,
            ..Default::default()
        });
        assert!(matches!(result, Err(AppError::AccountNotFound(_))));
    }
}
