//! Webhook DTOs

use cardledger_services::WebhookOutcome;
use serde::Serialize;

/// Acknowledgement returned to the provider
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub outcome: WebhookOutcome,
}

impl WebhookAck {
    pub fn ok(outcome: WebhookOutcome) -> Self {
        Self {
            status: "ok",
            outcome,
        }
    }
}
