//! Anti-fraud blocker
//!
//! Tracks consecutive failed authorizations per card. The threshold is
//! checked at the start of every authorization, so a card already at or
//! above it is blocked on its next attempt even if nothing incremented the
//! counter since. `ACTIVE -> BLOCKED` is one-directional here; unblocking
//! is an administrative action elsewhere.

use cardledger_core::{models::Card, traits::LedgerStore, AppResult};
use std::sync::Arc;
use tracing::{instrument, warn};

pub struct AntiFraudGuard {
    ledger: Arc<dyn LedgerStore>,
    threshold: i32,
}

impl AntiFraudGuard {
    pub fn new(ledger: Arc<dyn LedgerStore>, threshold: i32) -> Self {
        Self { ledger, threshold }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    /// Whether the card's failure counter has reached the threshold
    #[inline]
    pub fn is_tripped(&self, card: &Card) -> bool {
        card.failed_auth_count >= self.threshold
    }

    /// Count one failed authorization; returns the new counter value
    #[instrument(skip(self))]
    pub async fn record_failure(&self, card_id: i64) -> AppResult<i32> {
        let count = self.ledger.increment_failed_auth(card_id).await?;
        if count >= self.threshold {
            warn!(
                "Card {} reached {} failed attempts, it will be blocked on the next authorization",
                card_id, count
            );
        }
        Ok(count)
    }

    #[instrument(skip(self))]
    pub async fn block(&self, card_id: i64) -> AppResult<()> {
        warn!("ANTI-FRAUD: blocking card {}", card_id);
        self.ledger.block_card(card_id).await
    }
}
