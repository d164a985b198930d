//! PostgreSQL ledger store
//!
//! Every mutation runs in one transaction: the owning account row is locked
//! with `SELECT ... FOR UPDATE` (bounded by `lock_timeout`), sufficiency is
//! re-checked under the lock, then the balance update and the ledger entry
//! are written together. Card rows are always locked after their account so
//! lock order is consistent across operations.

use async_trait::async_trait;
use cardledger_core::{
    models::{
        Account, AccountStatus, Card, CardStatus, CardTransfer, EntryStatus, EntryType,
        LedgerEntry, LedgerMutation, ReplenishmentPolicy,
    },
    traits::LedgerStore,
    AppError, AppResult,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub(crate) const ACCOUNT_COLUMNS: &str =
    "id, balance, status, notification_endpoint, created_at, updated_at";

pub(crate) const CARD_COLUMNS: &str = "id, account_id, status, failed_auth_count, \
     daily_spend_limit, card_balance, auto_replenish_enabled, auto_replenish_threshold, \
     auto_replenish_amount, provider_card_id, masked_number, created_at";

const ENTRY_COLUMNS: &str = "id, account_id, card_id, amount, fee, entry_type, status, \
     detail, provider_tx_id, balance_after, created_at";

/// SQLSTATE raised when `lock_timeout` expires
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE raised by the provider transaction unique index
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL implementation of LedgerStore
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    /// Create a new ledger store
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn begin(&self) -> AppResult<Transaction<'static, Postgres>> {
        begin_locked(&self.pool, self.lock_timeout).await
    }

    /// Lock the owning account, then the card
    async fn lock_card_with_owner(
        conn: &mut PgConnection,
        card_id: i64,
    ) -> AppResult<(Account, Card)> {
        let account_id: i64 = sqlx::query_scalar("SELECT account_id FROM cards WHERE id = $1")
            .bind(card_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                error!("Database error resolving card {}: {}", card_id, e);
                AppError::Database(format!("Failed to resolve card: {}", e))
            })?
            .ok_or_else(|| AppError::CardNotFound(card_id.to_string()))?;

        let account = lock_account(&mut *conn, account_id).await?;

        let query = format!("SELECT {} FROM cards WHERE id = $1 FOR UPDATE", CARD_COLUMNS);
        let card = sqlx::query_as::<Postgres, CardRow>(&query)
            .bind(card_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_write_error(e, account_id, None, "lock card"))?
            .ok_or_else(|| AppError::CardNotFound(card_id.to_string()))?;

        Ok((account, card.into()))
    }

    async fn fetch_cards(&self, query: &str) -> AppResult<Vec<Card>> {
        let rows = sqlx::query_as::<Postgres, CardRow>(query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing cards: {}", e);
                AppError::Database(format!("Failed to list cards: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ==================== Shared transaction helpers ====================

/// Begin a transaction whose row-lock waits are bounded by `lock_timeout`
pub(crate) async fn begin_locked(
    pool: &PgPool,
    lock_timeout: Duration,
) -> AppResult<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await.map_err(|e| {
        error!("Failed to start transaction: {}", e);
        AppError::Transaction(format!("Failed to start transaction: {}", e))
    })?;

    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{}ms", lock_timeout.as_millis()))
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Database(format!("Failed to set lock timeout: {}", e)))?;

    Ok(tx)
}

pub(crate) async fn commit(tx: Transaction<'static, Postgres>) -> AppResult<()> {
    tx.commit().await.map_err(|e| {
        error!("Failed to commit transaction: {}", e);
        AppError::Transaction(format!("Failed to commit transaction: {}", e))
    })
}

/// Lock an account row for the rest of the transaction
pub(crate) async fn lock_account(conn: &mut PgConnection, account_id: i64) -> AppResult<Account> {
    let query = format!(
        "SELECT {} FROM accounts WHERE id = $1 FOR UPDATE",
        ACCOUNT_COLUMNS
    );

    let row = sqlx::query_as::<Postgres, AccountRow>(&query)
        .bind(account_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| map_write_error(e, account_id, None, "lock account"))?
        .ok_or_else(|| AppError::AccountNotFound(account_id.to_string()))?;

    Ok(row.into())
}

pub(crate) async fn set_account_balance(
    conn: &mut PgConnection,
    account_id: i64,
    balance: Decimal,
) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE accounts
        SET balance = $2,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(account_id)
    .bind(balance)
    .execute(conn)
    .await
    .map_err(|e| map_write_error(e, account_id, None, "update balance"))?;

    Ok(())
}

/// Append one ledger entry; returns its id
pub(crate) async fn insert_entry(
    conn: &mut PgConnection,
    mutation: &LedgerMutation,
    balance_after: Decimal,
) -> AppResult<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO ledger_entries (
            account_id, card_id, amount, fee, entry_type, status,
            detail, provider_tx_id, balance_after
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(mutation.account_id)
    .bind(mutation.card_id)
    .bind(mutation.delta)
    .bind(mutation.fee)
    .bind(mutation.entry_type.to_string())
    .bind(EntryStatus::Approved.to_string())
    .bind(&mutation.detail)
    .bind(&mutation.provider_tx_id)
    .bind(balance_after)
    .fetch_one(conn)
    .await
    .map_err(|e| {
        map_write_error(
            e,
            mutation.account_id,
            mutation.provider_tx_id.as_deref(),
            "insert ledger entry",
        )
    })?;

    Ok(id)
}

/// Classify a failed statement inside a ledger transaction
pub(crate) fn map_write_error(
    e: sqlx::Error,
    account_id: i64,
    provider_tx_id: Option<&str>,
    context: &str,
) -> AppError {
    if let Some(db_err) = e.as_database_error() {
        match db_err.code().as_deref() {
            Some(LOCK_NOT_AVAILABLE) => {
                warn!("Lock wait on account {} timed out during {}", account_id, context);
                return AppError::LockTimeout(account_id);
            }
            Some(UNIQUE_VIOLATION) => {
                if let Some(tx_id) = provider_tx_id {
                    return AppError::DuplicateProviderTransaction(tx_id.to_string());
                }
            }
            _ => {}
        }
    }

    error!("Database error during {} for account {}: {}", context, account_id, e);
    AppError::Database(format!("Failed to {}: {}", context, e))
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self))]
    async fn find_account(&self, account_id: i64) -> AppResult<Option<Account>> {
        debug!("Finding account by id: {}", account_id);

        let query = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        let row = sqlx::query_as::<Postgres, AccountRow>(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding account {}: {}", account_id, e);
                AppError::Database(format!("Failed to find account: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_card(&self, card_id: i64) -> AppResult<Option<Card>> {
        debug!("Finding card by id: {}", card_id);

        let query = format!("SELECT {} FROM cards WHERE id = $1", CARD_COLUMNS);
        let row = sqlx::query_as::<Postgres, CardRow>(&query)
            .bind(card_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding card {}: {}", card_id, e);
                AppError::Database(format!("Failed to find card: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_card_by_provider_id(&self, provider_card_id: &str) -> AppResult<Option<Card>> {
        debug!("Finding card by provider id: {}", provider_card_id);

        let query = format!("SELECT {} FROM cards WHERE provider_card_id = $1", CARD_COLUMNS);
        let row = sqlx::query_as::<Postgres, CardRow>(&query)
            .bind(provider_card_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding card {}: {}", provider_card_id, e);
                AppError::Database(format!("Failed to find card: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn provider_tx_exists(&self, provider_tx_id: &str) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM ledger_entries WHERE provider_tx_id = $1)",
        )
        .bind(provider_tx_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error checking provider tx {}: {}", provider_tx_id, e);
            AppError::Database(format!("Failed to check provider transaction: {}", e))
        })?;

        Ok(exists)
    }

    #[instrument(skip(self))]
    async fn cards_needing_replenishment(&self) -> AppResult<Vec<Card>> {
        let query = format!(
            r#"
            SELECT {}
            FROM cards
            WHERE auto_replenish_enabled = TRUE
              AND status = 'ACTIVE'
              AND card_balance <= auto_replenish_threshold
            ORDER BY id
            "#,
            CARD_COLUMNS
        );

        self.fetch_cards(&query).await
    }

    #[instrument(skip(self))]
    async fn cards_with_provider_ref(&self) -> AppResult<Vec<Card>> {
        let query = format!(
            r#"
            SELECT {}
            FROM cards
            WHERE provider_card_id IS NOT NULL
              AND status = 'ACTIVE'
            ORDER BY id
            "#,
            CARD_COLUMNS
        );

        self.fetch_cards(&query).await
    }

    #[instrument(skip(self))]
    async fn entries_for_account(&self, account_id: i64) -> AppResult<Vec<LedgerEntry>> {
        let query = format!(
            "SELECT {} FROM ledger_entries WHERE account_id = $1 ORDER BY id",
            ENTRY_COLUMNS
        );

        let rows = sqlx::query_as::<Postgres, EntryRow>(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error listing entries of {}: {}", account_id, e);
                AppError::Database(format!("Failed to list ledger entries: {}", e))
            })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn total_spent(&self, account_id: i64) -> AppResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(-SUM(amount), 0)
            FROM ledger_entries
            WHERE account_id = $1
              AND entry_type = 'CAPTURE'
              AND status = 'APPROVED'
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error summing spend of {}: {}", account_id, e);
            AppError::Database(format!("Failed to compute total spent: {}", e))
        })?;

        Ok(total)
    }

    #[instrument(skip(self, mutation), fields(account_id = mutation.account_id, entry_type = %mutation.entry_type))]
    async fn apply(&self, mutation: LedgerMutation) -> AppResult<Decimal> {
        let mut tx = self.begin().await?;

        let account = lock_account(&mut *tx, mutation.account_id).await?;

        let guarded_card = match (mutation.fraud_threshold, mutation.card_id) {
            (Some(_), Some(card_id)) => {
                let query = format!(
                    "SELECT {} FROM cards WHERE id = $1 AND account_id = $2 FOR UPDATE",
                    CARD_COLUMNS
                );
                let card: Card = sqlx::query_as::<Postgres, CardRow>(&query)
                    .bind(card_id)
                    .bind(account.id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_write_error(e, account.id, None, "lock card"))?
                    .ok_or_else(|| AppError::CardNotFound(card_id.to_string()))?
                    .into();

                if let Err(e) = mutation.check_card(&card) {
                    warn!("Refusing capture on card {}: {}", card.id, e);
                    return Err(e);
                }
                Some(card.id)
            }
            _ => None,
        };

        let new_balance = account.balance + mutation.net_delta();
        if new_balance < Decimal::ZERO {
            warn!(
                "Insufficient balance for account {}: required {}, available {}",
                account.id,
                -mutation.net_delta(),
                account.balance
            );
            return Err(AppError::InsufficientBalance {
                required: (-mutation.net_delta()).to_string(),
                available: account.balance.to_string(),
            });
        }

        set_account_balance(&mut *tx, account.id, new_balance).await?;

        if let Some(card_id) = guarded_card {
            sqlx::query("UPDATE cards SET failed_auth_count = 0 WHERE id = $1")
                .bind(card_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_write_error(e, account.id, None, "reset failure counter"))?;
        }

        let entry_id = insert_entry(&mut *tx, &mutation, new_balance).await?;

        commit(tx).await?;

        info!(
            "Applied {} entry {} to account {}: delta={} fee={} balance={}",
            mutation.entry_type, entry_id, account.id, mutation.delta, mutation.fee, new_balance
        );

        Ok(new_balance)
    }

    #[instrument(skip(self))]
    async fn apply_card_balance(&self, card_id: i64, delta: Decimal) -> AppResult<Decimal> {
        let mut tx = self.begin().await?;

        let (_, card) = Self::lock_card_with_owner(&mut *tx, card_id).await?;

        let new_balance = card.card_balance + delta;
        if new_balance < Decimal::ZERO {
            return Err(AppError::InsufficientBalance {
                required: (-delta).to_string(),
                available: card.card_balance.to_string(),
            });
        }

        sqlx::query("UPDATE cards SET card_balance = $2 WHERE id = $1")
            .bind(card_id)
            .bind(new_balance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, card.account_id, None, "update card balance"))?;

        commit(tx).await?;

        debug!("Card {} balance changed by {} to {}", card_id, delta, new_balance);
        Ok(new_balance)
    }

    #[instrument(skip(self))]
    async fn sync_card_balance(&self, card_id: i64, balance: Decimal) -> AppResult<Decimal> {
        if balance < Decimal::ZERO {
            return Err(AppError::InvalidInput(format!(
                "Card balance cannot be negative: {}",
                balance
            )));
        }

        let mut tx = self.begin().await?;

        let (_, card) = Self::lock_card_with_owner(&mut *tx, card_id).await?;

        sqlx::query("UPDATE cards SET card_balance = $2 WHERE id = $1")
            .bind(card_id)
            .bind(balance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, card.account_id, None, "sync card balance"))?;

        commit(tx).await?;

        info!(
            "Card {} balance synced: {} -> {}",
            card_id, card.card_balance, balance
        );
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

        let mut tx = self.begin().await?;

        let (account, card) = Self::lock_card_with_owner(&mut *tx, card_id).await?;

        if account.balance < amount {
            warn!(
                "Insufficient balance for transfer to card {}: required {}, available {}",
                card_id, amount, account.balance
            );
            return Err(AppError::InsufficientBalance {
                required: amount.to_string(),
                available: account.balance.to_string(),
            });
        }

        let account_balance = account.balance - amount;
        let card_balance = card.card_balance + amount;

        set_account_balance(&mut *tx, account.id, account_balance).await?;

        sqlx::query("UPDATE cards SET card_balance = $2 WHERE id = $1")
            .bind(card_id)
            .bind(card_balance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, account.id, None, "credit card"))?;

        let mutation =
            LedgerMutation::new(account.id, -amount, EntryType::Fund, detail).with_card(card_id);
        let entry_id = insert_entry(&mut *tx, &mutation, account_balance).await?;

        commit(tx).await?;

        info!(
            "Transferred {} from account {} to card {}: account={} card={}",
            amount, account.id, card_id, account_balance, card_balance
        );

        Ok(CardTransfer {
            account_balance,
            card_balance,
            entry_id,
        })
    }

    #[instrument(skip(self))]
    async fn increment_failed_auth(&self, card_id: i64) -> AppResult<i32> {
        let mut tx = self.begin().await?;

        let (account, _) = Self::lock_card_with_owner(&mut *tx, card_id).await?;

        let count: i32 = sqlx::query_scalar(
            r#"
            UPDATE cards
            SET failed_auth_count = failed_auth_count + 1
            WHERE id = $1
            RETURNING failed_auth_count
            "#,
        )
        .bind(card_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, account.id, None, "increment failure counter"))?;

        commit(tx).await?;

        debug!("Card {} failure counter is now {}", card_id, count);
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn block_card(&self, card_id: i64) -> AppResult<()> {
        let mut tx = self.begin().await?;

        let (account, _) = Self::lock_card_with_owner(&mut *tx, card_id).await?;

        sqlx::query("UPDATE cards SET status = $2 WHERE id = $1")
            .bind(card_id)
            .bind(CardStatus::Blocked.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, account.id, None, "block card"))?;

        commit(tx).await?;

        warn!("Card {} blocked", card_id);
        Ok(())
    }
}

// ==================== Row mapping ====================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AccountRow {
    id: i64,
    balance: Decimal,
    status: String,
    notification_endpoint: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            balance: row.balance,
            status: AccountStatus::from_str(&row.status).unwrap_or_default(),
            notification_endpoint: row.notification_endpoint,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CardRow {
    id: i64,
    account_id: i64,
    status: String,
    failed_auth_count: i32,
    daily_spend_limit: Option<Decimal>,
    card_balance: Decimal,
    auto_replenish_enabled: bool,
    auto_replenish_threshold: Decimal,
    auto_replenish_amount: Decimal,
    provider_card_id: Option<String>,
    masked_number: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<CardRow> for Card {
    fn from(row: CardRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            // Unknown statuses must never authorize
            status: CardStatus::from_str(&row.status).unwrap_or(CardStatus::Frozen),
            failed_auth_count: row.failed_auth_count,
            daily_spend_limit: row.daily_spend_limit,
            card_balance: row.card_balance,
            replenishment: ReplenishmentPolicy {
                enabled: row.auto_replenish_enabled,
                threshold: row.auto_replenish_threshold,
                amount: row.auto_replenish_amount,
            },
            provider_card_id: row.provider_card_id,
            masked_number: row.masked_number,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: i64,
    account_id: i64,
    card_id: Option<i64>,
    amount: Decimal,
    fee: Decimal,
    entry_type: String,
    status: String,
    detail: String,
    provider_tx_id: Option<String>,
    balance_after: Decimal,
    created_at: DateTime<Utc>,
}

impl From<EntryRow> for LedgerEntry {
    fn from(row: EntryRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            card_id: row.card_id,
            amount: row.amount,
            fee: row.fee,
            entry_type: EntryType::from_str(&row.entry_type).unwrap_or(EntryType::Adjustment),
            status: EntryStatus::from_str(&row.status).unwrap_or(EntryStatus::Declined),
            detail: row.detail,
            provider_tx_id: row.provider_tx_id,
            balance_after: row.balance_after,
            created_at: row.created_at,
        }
    }
}
