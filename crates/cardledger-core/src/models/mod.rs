//! Domain models for CardLedger
//!
//! Accounts and cards are owned by external collaborators; this crate only
//! reads them and mutates balances, counters and status through the ledger.

pub mod account;
pub mod card;
pub mod decision;
pub mod grade;
pub mod ledger;
pub mod referral;

pub use account::{Account, AccountStatus};
pub use card::{Card, CardStatus, ReplenishmentPolicy};
pub use decision::{AuthorizationDecision, AuthorizationRequest, DeclineReason, DecisionStatus};
pub use grade::{Grade, GradeInfo, GradeRecord};
pub use ledger::{CardTransfer, EntryStatus, EntryType, LedgerEntry, LedgerMutation};
pub use referral::{Referral, ReferralStatus};
