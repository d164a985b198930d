//! Shared handler state

use cardledger_core::{config::WebhookConfig, AppResult};
use cardledger_services::{WebhookGuard, WebhookIngestor};

/// Everything the provider webhook route needs
pub struct WebhookEndpoint {
    pub guard: WebhookGuard,
    pub ingestor: WebhookIngestor,
    /// Header carrying the hex HMAC signature
    pub signature_header: String,
    pub trust_forwarded_for: bool,
}

impl WebhookEndpoint {
    pub fn new(config: &WebhookConfig, ingestor: WebhookIngestor) -> AppResult<Self> {
        Ok(Self {
            guard: WebhookGuard::from_config(config)?,
            ingestor,
            signature_header: config.signature_header.clone(),
            trust_forwarded_for: config.trust_forwarded_for,
        })
    }
}
