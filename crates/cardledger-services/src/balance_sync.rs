//! Card balance synchronization with the provider
//!
//! Walks active cards that carry a provider reference and overwrites their
//! local balance with the provider's figure. One card's failure is logged
//! and counted; the sweep always finishes.

use cardledger_core::{
    models::Card,
    traits::{LedgerStore, ProviderClient},
    AppError, AppResult,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
}

pub struct BalanceSyncService {
    ledger: Arc<dyn LedgerStore>,
    provider: Arc<dyn ProviderClient>,
}

impl BalanceSyncService {
    pub fn new(ledger: Arc<dyn LedgerStore>, provider: Arc<dyn ProviderClient>) -> Self {
        Self { ledger, provider }
    }

    /// Fetch one card's balance from the provider and store it
    #[instrument(skip(self, card), fields(card_id = card.id))]
    pub async fn sync_card(&self, card: &Card) -> AppResult<Decimal> {
        let provider_card_id = card.provider_card_id.as_deref().ok_or_else(|| {
            AppError::InvalidInput(format!("Card {} has no provider reference", card.id))
        })?;

        let balance = self.provider.card_balance(provider_card_id).await?;
        self.ledger.sync_card_balance(card.id, balance).await
    }

    /// Sync every active card with a provider reference
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> AppResult<SyncReport> {
        let cards = self.ledger.cards_with_provider_ref().await?;
        let mut report = SyncReport::default();

        for card in &cards {
            match self.sync_card(card).await {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    warn!("Failed to sync balance of card {}: {}", card.id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Balance sync completed: {} synced, {} failed",
            report.synced, report.failed
        );
        Ok(report)
    }

    /// Spawn the periodic sweep; it exits when `shutdown` flips to `true`
    pub fn start(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Balance sync worker started (every {:?})", every);

            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                if let Err(e) = self.sync_all().await {
                    error!("Balance sync failed: {}", e);
                }
            }

            info!("Balance sync worker stopped");
        })
    }
}
