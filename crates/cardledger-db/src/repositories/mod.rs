//! PostgreSQL repository implementations

pub mod grade_repo;
pub mod ledger_repo;
pub mod referral_repo;

pub use grade_repo::PgGradeRepository;
pub use ledger_repo::PgLedgerStore;
pub use referral_repo::PgReferralRepository;
