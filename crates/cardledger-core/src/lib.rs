//! CardLedger Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the prepaid-card ledger. It includes:
//!
//! - Domain models (Account, Card, LedgerEntry, GradeRecord, Referral)
//! - Store, notifier, and provider traits implemented by outer crates
//! - Unified error handling with HTTP response mapping
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
