//! API layer for CardLedger
//!
//! Thin HTTP surface over the services: authorization, provider webhooks
//! and health.

#![forbid(unsafe_code)]

pub mod dto;
pub mod handlers;
pub mod state;

use actix_web::web;
use cardledger_core::AppError;

pub use dto::{AuthorizeRequest, WebhookAck};
pub use state::WebhookEndpoint;

/// Mount every route under `/api/v1`
///
/// Expects `web::Data<AuthorizationService>` and `web::Data<WebhookEndpoint>`
/// in app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .app_data(web::JsonConfig::default().error_handler(|err, _req| {
                AppError::InvalidPayload(err.to_string()).into()
            }))
            .configure(handlers::health::configure)
            .configure(handlers::authorization::configure)
            .configure(handlers::webhook::configure),
    );
}
