//! Auto-replenishment scheduler
//!
//! On a fixed interval (after an initial delay) scans active cards with
//! replenishment enabled whose balance is at or below the threshold, and
//! moves the configured top-up amount from the owning account into the
//! card. Each card is an independent atomic transfer: one card's failure is
//! logged and counted, never aborts the batch. Shutdown is only observed
//! between cards.

use crate::notifier::notify_account;
use cardledger_core::{
    config::ReplenishmentConfig,
    models::Card,
    traits::{LedgerStore, Notifier},
    AppError, AppResult,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Counters of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplenishmentReport {
    pub scanned: usize,
    pub replenished: usize,
    /// Owner balance did not cover the top-up
    pub insufficient: usize,
    pub failed: usize,
    /// Scan stopped early on shutdown
    pub interrupted: bool,
}

enum CardOutcome {
    Replenished,
    Insufficient,
}

pub struct ReplenishmentScheduler {
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    initial_delay: Duration,
}

impl ReplenishmentScheduler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self {
            ledger,
            notifier,
            interval,
            initial_delay,
        }
    }

    pub fn from_config(
        ledger: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        config: &ReplenishmentConfig,
    ) -> Self {
        Self::new(ledger, notifier, config.interval(), config.initial_delay())
    }

    /// Run one scan over every card due for a top-up
    pub async fn run_once(&self) -> AppResult<ReplenishmentReport> {
        self.scan(|| false).await
    }

    #[instrument(skip_all)]
    async fn scan<F>(&self, should_stop: F) -> AppResult<ReplenishmentReport>
    where
        F: Fn() -> bool,
    {
        let cards = self.ledger.cards_needing_replenishment().await?;
        let mut report = ReplenishmentReport {
            scanned: cards.len(),
            ..Default::default()
        };

        if cards.is_empty() {
            debug!("[AUTO-REPLENISH] No cards need replenishment");
            return Ok(report);
        }

        info!("[AUTO-REPLENISH] Found {} cards needing replenishment", cards.len());

        for card in &cards {
            if should_stop() {
                info!("[AUTO-REPLENISH] Shutdown requested, stopping scan");
                report.interrupted = true;
                break;
            }

            match self.replenish_card(card).await {
                Ok(CardOutcome::Replenished) => report.replenished += 1,
                Ok(CardOutcome::Insufficient) => report.insufficient += 1,
                Err(e) => {
                    error!("[AUTO-REPLENISH] Error processing card {}: {}", card.id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "[AUTO-REPLENISH] Completed: {} replenished, {} insufficient, {} failed",
            report.replenished, report.insufficient, report.failed
        );

        Ok(report)
    }

    #[instrument(skip(self, card), fields(card_id = card.id))]
    async fn replenish_card(&self, card: &Card) -> AppResult<CardOutcome> {
        let amount = card.replenishment.amount;

        let account = self
            .ledger
            .find_account(card.account_id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(card.account_id.to_string()))?;

        debug!(
            "Card {} balance {} threshold {}, account balance {}",
            card.id, card.card_balance, card.replenishment.threshold, account.balance
        );

        let insufficient_message = |available: Decimal| {
            format!(
                "Auto-replenishment failed: insufficient funds to top up card ...{}. Required: {}, available: {}",
                card.last4(),
                amount,
                available
            )
        };

        if !account.can_cover(amount) {
            warn!(
                "[AUTO-REPLENISH] Insufficient balance for card {}: required {}, available {}",
                card.id, amount, account.balance
            );
            notify_account(
                self.notifier.as_ref(),
                &account,
                &insufficient_message(account.balance),
            )
            .await;
            return Ok(CardOutcome::Insufficient);
        }

        let detail = format!(
            "Auto-replenishment: card ...{} replenished with {}",
            card.last4(),
            amount
        );

        match self.ledger.transfer_to_card(card.id, amount, &detail).await {
            Ok(transfer) => {
                info!(
                    "[AUTO-REPLENISH] Card {} replenished with {}",
                    card.id, amount
                );
                notify_account(
                    self.notifier.as_ref(),
                    &account,
                    &format!(
                        "Auto-replenishment: card ...{} topped up by {}. New card balance: {}",
                        card.last4(),
                        amount,
                        transfer.card_balance
                    ),
                )
                .await;
                Ok(CardOutcome::Replenished)
            }
            Err(AppError::InsufficientBalance { available, .. }) => {
                warn!(
                    "[AUTO-REPLENISH] Balance of account {} dropped before top-up of card {}",
                    account.id, card.id
                );
                notify_account(
                    self.notifier.as_ref(),
                    &account,
                    &insufficient_message(available.parse().unwrap_or(account.balance)),
                )
                .await;
                Ok(CardOutcome::Insufficient)
            }
            Err(e) => Err(e),
        }
    }

    /// Spawn the periodic loop; it exits when `shutdown` flips to `true`
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "[AUTO-REPLENISH] Worker started: first run in {:?}, then every {:?}",
                self.initial_delay, self.interval
            );

            tokio::select! {
                _ = sleep(self.initial_delay) => {}
                _ = shutdown.changed() => {
                    info!("[AUTO-REPLENISH] Worker stopped before first run");
                    return;
                }
            }

            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let stop = shutdown.clone();
                if let Err(e) = self.scan(move || *stop.borrow()).await {
                    error!("[AUTO-REPLENISH] Scan failed: {}", e);
                }

                if *shutdown.borrow() {
                    break;
                }
            }

            info!("[AUTO-REPLENISH] Worker stopped");
        })
    }
}
