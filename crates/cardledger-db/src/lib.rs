//! CardLedger Database Layer
//!
//! This crate provides the two `LedgerStore` implementations:
//!
//! - `PgLedgerStore`: PostgreSQL transactions with `SELECT ... FOR UPDATE`
//!   row locks and a bounded lock wait
//! - `MemoryLedgerStore`: in-process store with a per-account async mutex,
//!   used by tests and single-node deployments without a database
//!
//! plus grade and referral repositories, pool management and the embedded
//! schema migrations.

pub mod memory;
pub mod pool;
pub mod repositories;

pub use memory::MemoryLedgerStore;
pub use pool::{create_pool, run_migrations};
pub use repositories::*;

// Re-export commonly used types
pub use cardledger_core::{AppError, AppResult};
pub use sqlx::PgPool;
