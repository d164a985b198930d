//! Authorization handler

use crate::dto::AuthorizeRequest;
use actix_web::{web, HttpResponse};
use cardledger_core::{models::AuthorizationRequest, AppError};
use cardledger_services::AuthorizationService;
use tracing::{instrument, warn};
use validator::Validate;

/// Approve or decline a card charge
///
/// POST /api/v1/authorize
///
/// Declines are a 200 with `"status": "DECLINED"`; only malformed input and
/// storage faults produce error statuses.
#[instrument(skip(service, req), fields(card_id = req.card_id))]
pub async fn authorize(
    service: web::Data<AuthorizationService>,
    req: web::Json<AuthorizeRequest>,
) -> Result<HttpResponse, AppError> {
    req.validate().map_err(|e| {
        warn!("Authorization request validation failed: {}", e);
        AppError::Validation(e.to_string())
    })?;

    let request: AuthorizationRequest = req.into_inner().into();
    let decision = service.authorize(&request).await?;

    Ok(HttpResponse::Ok().json(decision))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/authorize", web::post().to(authorize));
}
