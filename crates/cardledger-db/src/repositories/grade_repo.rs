//! Grade record repository

use async_trait::async_trait;
use cardledger_core::{
    models::{Grade, GradeRecord},
    traits::GradeRepository,
    AppError, AppResult,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, error, instrument};

/// PostgreSQL implementation of GradeRepository
pub struct PgGradeRepository {
    pool: PgPool,
}

impl PgGradeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GradeRepository for PgGradeRepository {
    #[instrument(skip(self))]
    async fn find_grade(&self, account_id: i64) -> AppResult<Option<GradeRecord>> {
        let row = sqlx::query_as::<sqlx::Postgres, GradeRow>(
            r#"
            SELECT account_id, total_spent, grade, fee_percent, updated_at
            FROM grade_records
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error finding grade of {}: {}", account_id, e);
            AppError::Database(format!("Failed to find grade: {}", e))
        })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, record), fields(account_id = record.account_id))]
    async fn save_grade(&self, record: &GradeRecord) -> AppResult<bool> {
        debug!(
            "Saving grade {} ({}%) for account {}",
            record.grade, record.fee_percent, record.account_id
        );

        let result = sqlx::query(
            r#"
            INSERT INTO grade_records (account_id, total_spent, grade, fee_percent, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id) DO UPDATE
            SET total_spent = EXCLUDED.total_spent,
                grade = EXCLUDED.grade,
                fee_percent = EXCLUDED.fee_percent,
                updated_at = EXCLUDED.updated_at
            WHERE grade_records.total_spent <= EXCLUDED.total_spent
            "#,
        )
        .bind(record.account_id)
        .bind(record.total_spent)
        .bind(record.grade.to_string())
        .bind(record.fee_percent)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error saving grade of {}: {}", record.account_id, e);
            AppError::Database(format!("Failed to save grade: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GradeRow {
    account_id: i64,
    total_spent: Decimal,
    grade: String,
    fee_percent: Decimal,
    updated_at: DateTime<Utc>,
}

impl From<GradeRow> for GradeRecord {
    fn from(row: GradeRow) -> Self {
        Self {
            account_id: row.account_id,
            total_spent: row.total_spent,
            grade: Grade::from_str(&row.grade).unwrap_or_default(),
            fee_percent: row.fee_percent,
            updated_at: row.updated_at,
        }
    }
}
