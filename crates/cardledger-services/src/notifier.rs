//! Notification sink
//!
//! Delivery itself belongs to an external collaborator. The services only
//! decide that a message should go out and what it says; a failed send is
//! logged and never changes the outcome already decided.

use async_trait::async_trait;
use cardledger_core::{models::Account, traits::Notifier, AppResult};
use tracing::{debug, info, warn};

/// Notifier that writes every message to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, endpoint: &str, message: &str) -> AppResult<()> {
        info!(endpoint = %endpoint, "notification: {}", message);
        Ok(())
    }
}

/// Best-effort delivery to an account's registered endpoint
pub async fn notify_account(notifier: &dyn Notifier, account: &Account, message: &str) {
    let Some(endpoint) = account.notification_endpoint.as_deref() else {
        debug!("Account {} has no notification endpoint, skipping", account.id);
        return;
    };

    if let Err(e) = notifier.send(endpoint, message).await {
        warn!("Failed to notify account {}: {}", account.id, e);
    }
}
