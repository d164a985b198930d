//! Fee tier resolution
//!
//! The grade is a pure function of cumulative approved capture spend. The
//! spend is always recomputed from the ledger, never tracked incrementally.

use crate::round_money;
use cardledger_core::{
    models::{Grade, GradeInfo, GradeRecord},
    traits::{GradeRepository, LedgerStore},
    AppResult,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Resolve the grade and fee percentage for a cumulative spend
pub fn grade_for(total_spent: Decimal) -> (Grade, Decimal) {
    let grade = Grade::ALL
        .iter()
        .rev()
        .find(|g| total_spent >= g.threshold())
        .copied()
        .unwrap_or_default();

    (grade, grade.fee_percent())
}

/// Describe a grade record with progress toward the next level
pub fn grade_info(record: &GradeRecord) -> GradeInfo {
    let next_grade = record.grade.next();
    let remaining_to_next = next_grade.map(|next| {
        let remaining = next.threshold() - record.total_spent;
        remaining.max(Decimal::ZERO)
    });

    GradeInfo {
        grade: record.grade,
        fee_percent: record.fee_percent,
        total_spent: record.total_spent,
        next_grade,
        remaining_to_next,
    }
}

/// `amount × percent / 100`, rounded to the minor unit
pub fn compute_fee(amount: Decimal, fee_percent: Decimal) -> Decimal {
    round_money(amount * fee_percent / Decimal::ONE_HUNDRED)
}

/// Grade lookup and recomputation
pub struct GradeService {
    ledger: Arc<dyn LedgerStore>,
    grades: Arc<dyn GradeRepository>,
    default_fee_percent: Decimal,
}

impl GradeService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        grades: Arc<dyn GradeRepository>,
        default_fee_percent: Decimal,
    ) -> Self {
        Self {
            ledger,
            grades,
            default_fee_percent,
        }
    }

    pub fn default_fee_percent(&self) -> Decimal {
        self.default_fee_percent
    }

    /// Fee percentage as of now, falling back to the default when no record exists
    #[instrument(skip(self))]
    pub async fn current_fee_percent(&self, account_id: i64) -> AppResult<Decimal> {
        match self.grades.find_grade(account_id).await? {
            Some(record) => Ok(record.fee_percent),
            None => {
                debug!(
                    "No grade record for account {}, using default {}%",
                    account_id, self.default_fee_percent
                );
                Ok(self.default_fee_percent)
            }
        }
    }

    /// Recompute the grade from the ledger and persist it
    #[instrument(skip(self))]
    pub async fn refresh(&self, account_id: i64) -> AppResult<GradeRecord> {
        let total_spent = self.ledger.total_spent(account_id).await?;
        let (grade, fee_percent) = grade_for(total_spent);

        let previous = self.grades.find_grade(account_id).await?;

        let record = GradeRecord {
            account_id,
            total_spent,
            grade,
            fee_percent,
            updated_at: Utc::now(),
        };
        if !self.grades.save_grade(&record).await? {
            debug!(
                "Kept newer grade record for account {} over stale total {}",
                account_id, total_spent
            );
            return Ok(self.grades.find_grade(account_id).await?.unwrap_or(record));
        }

        match previous {
            Some(prev) if prev.grade != grade => {
                info!(
                    "Account {} moved from {} to {} (spent {})",
                    account_id, prev.grade, grade, total_spent
                );
            }
            _ => debug!("Account {} grade {} (spent {})", account_id, grade, total_spent),
        }

        Ok(record)
    }

    /// Grade summary, computed on the fly when no record exists yet
    pub async fn info(&self, account_id: i64) -> AppResult<GradeInfo> {
        let record = match self.grades.find_grade(account_id).await? {
            Some(record) => record,
            None => self.refresh(account_id).await?,
        };
        Ok(grade_info(&record))
    }

    /// Recompute in the background; failures are only logged
    pub fn spawn_refresh(self: &Arc<Self>, account_id: i64) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.refresh(account_id).await {
                if e.is_retryable() {
                    warn!("Grade refresh for account {} failed: {}", account_id, e);
                } else {
                    error!("Grade refresh for account {} failed: {}", account_id, e);
                }
            }
        });
    }
}
