//! Provider webhook handler

use crate::dto::WebhookAck;
use crate::state::WebhookEndpoint;
use actix_web::{web, HttpRequest, HttpResponse};
use cardledger_core::AppError;
use cardledger_services::{webhook::client_ip, WebhookPayload};
use tracing::{debug, instrument};

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Receive one provider event
///
/// POST /api/v1/webhooks/provider
///
/// The body is taken raw so the signature is checked over the exact bytes
/// the provider signed.
#[instrument(skip_all)]
pub async fn provider_webhook(
    req: HttpRequest,
    body: web::Bytes,
    endpoint: web::Data<WebhookEndpoint>,
) -> Result<HttpResponse, AppError> {
    let source = client_ip(
        header(&req, "X-Forwarded-For"),
        header(&req, "X-Real-IP"),
        req.peer_addr().map(|addr| addr.ip()),
        endpoint.trust_forwarded_for,
    );

    endpoint.guard.check_origin(source)?;
    endpoint
        .guard
        .verify_signature(&body, header(&req, &endpoint.signature_header))?;

    let payload = WebhookPayload::from_slice(&body)?;
    debug!(
        "Webhook {} for card {} from {:?}",
        payload.event_type, payload.card_id, source
    );

    let outcome = endpoint.ingestor.ingest(&payload).await?;

    Ok(HttpResponse::Ok().json(WebhookAck::ok(outcome)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/webhooks/provider", web::post().to(provider_webhook));
}
