//! Business logic services for CardLedger
//!
//! Every money-moving path ends in a `LedgerStore`; the services here decide
//! *whether* and *how much* to move, and what to tell the account holder.
//!
//! # Services
//!
//! - `GradeService` / `grade_for` - Fee tier resolution from spend history
//! - `AntiFraudGuard` - Consecutive-failure counting and card blocking
//! - `AuthorizationService` - Real-time approve/decline of card charges
//! - `ReplenishmentScheduler` - Periodic account-to-card top-ups
//! - `WebhookGuard` / `WebhookIngestor` - Provider event gates and effects
//! - `RevShareService` - Referral commission crediting
//! - `BalanceSyncService` - Card balance sweep against the provider API
//! - `LogNotifier` - Notification sink that writes to the log

pub mod anti_fraud;
pub mod authorization;
pub mod balance_sync;
pub mod fee_tier;
pub mod notifier;
pub mod provider;
pub mod replenishment;
pub mod revshare;
pub mod webhook;

pub use anti_fraud::AntiFraudGuard;
pub use authorization::AuthorizationService;
pub use balance_sync::{BalanceSyncService, SyncReport};
pub use fee_tier::{grade_for, grade_info, GradeService};
pub use notifier::LogNotifier;
pub use provider::HttpProviderClient;
pub use replenishment::{ReplenishmentReport, ReplenishmentScheduler};
pub use revshare::RevShareService;
pub use webhook::{WebhookGuard, WebhookIngestor, WebhookOutcome, WebhookPayload};

/// Business logic constants
pub mod constants {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Fee percentage when an account has no grade record
    pub const DEFAULT_FEE_PERCENT: Decimal = dec!(6.70);

    /// Flat fee reported on declines
    pub const DEFAULT_DECLINE_FEE: Decimal = dec!(0.50);

    /// Currency shown when a provider event omits it
    pub const DEFAULT_CURRENCY: &str = "RUB";

    /// Merchant shown when a provider event omits it
    pub const UNKNOWN_MERCHANT: &str = "Unknown";

    /// Minor currency unit scale
    pub const MONEY_SCALE: u32 = 2;
}

/// Round a money amount to the minor unit, midpoint away from zero
pub fn round_money(amount: rust_decimal::Decimal) -> rust_decimal::Decimal {
    amount.round_dp_with_strategy(
        constants::MONEY_SCALE,
        rust_decimal::RoundingStrategy::MidpointAwayFromZero,
    )
}
