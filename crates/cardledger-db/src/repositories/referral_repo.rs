//! Referral repository
//!
//! Commission crediting shares the ledger's locking discipline: the
//! referrer's account row is locked, credited and journaled in the same
//! transaction that bumps `commission_earned`.

use super::ledger_repo::{
    begin_locked, commit, insert_entry, lock_account, map_write_error, set_account_balance,
};
use async_trait::async_trait;
use cardledger_core::{
    models::{EntryType, LedgerMutation, Referral, ReferralStatus},
    traits::ReferralRepository,
    AppError, AppResult,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info, instrument};

/// PostgreSQL implementation of ReferralRepository
pub struct PgReferralRepository {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgReferralRepository {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

#[async_trait]
impl ReferralRepository for PgReferralRepository {
    #[instrument(skip(self))]
    async fn find_referral(&self, referral_id: i64) -> AppResult<Option<Referral>> {
        let row = sqlx::query_as::<sqlx::Postgres, ReferralRow>(
            r#"
            SELECT id, referrer_id, referred_id, status, commission_earned, created_at
            FROM referrals
            WHERE id = $1
            "#,
        )
        .bind(referral_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding referral {}: {}", referral_id, e);
            AppError::Database(format!("Failed to find referral: {}", e))
        })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn find_active_referral_for(&self, referred_id: i64) -> AppResult<Option<Referral>> {
        let row = sqlx::query_as::<sqlx::Postgres, ReferralRow>(
            r#"
            SELECT id, referrer_id, referred_id, status, commission_earned, created_at
            FROM referrals
            WHERE referred_id = $1 AND status = 'ACTIVE'
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(referred_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding referral of {}: {}", referred_id, e);
            AppError::Database(format!("Failed to find referral: {}", e))
        })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, detail))]
    async fn credit_referral(
        &self,
        referral_id: i64,
        commission: Decimal,
        detail: &str,
    ) -> AppResult<Decimal> {
        let referral = self
            .find_referral(referral_id)
            .await?
            .ok_or_else(|| AppError::ReferralNotFound(referral_id.to_string()))?;

        let mut tx = begin_locked(&self.pool, self.lock_timeout).await?;

        let account = lock_account(&mut *tx, referral.referrer_id).await?;
        let new_balance = account.balance + commission;

        set_account_balance(&mut *tx, account.id, new_balance).await?;

        let mutation =
            LedgerMutation::new(account.id, commission, EntryType::ReferralRevenue, detail);
        insert_entry(&mut *tx, &mutation, new_balance).await?;

        sqlx::query(
            r#"
            UPDATE referrals
            SET commission_earned = commission_earned + $2
            WHERE id = $1
            "#,
        )
        .bind(referral_id)
        .bind(commission)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, account.id, None, "update commission"))?;

        commit(tx).await?;

        info!(
            "Credited referral commission {} to account {} (referral {})",
            commission, account.id, referral_id
        );

        Ok(new_balance)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReferralRow {
    id: i64,
    referrer_id: i64,
    referred_id: i64,
    status: String,
    commission_earned: Decimal,
    created_at: DateTime<Utc>,
}

impl From<ReferralRow> for Referral {
    fn from(row: ReferralRow) -> Self {
        Self {
            id: row.id,
            referrer_id: row.referrer_id,
            referred_id: row.referred_id,
            status: ReferralStatus::from_str(&row.status).unwrap_or(ReferralStatus::Inactive),
            commission_earned: row.commission_earned,
            created_at: row.created_at,
        }
    }
}
