//! Authorization DTOs

use cardledger_core::models::AuthorizationRequest;
use cardledger_services::constants::UNKNOWN_MERCHANT;
use rust_decimal::Decimal;
use serde::Deserialize;
use validator::Validate;

/// Authorization request from the card network side
///
/// The response is `AuthorizationDecision` as-is.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AuthorizeRequest {
    #[validate(range(min = 1))]
    pub card_id: i64,

    /// Positivity is enforced by the authorization engine
    pub amount: Decimal,

    #[serde(default)]
    #[validate(length(max = 255))]
    pub merchant_name: Option<String>,
}

impl From<AuthorizeRequest> for AuthorizationRequest {
    fn from(req: AuthorizeRequest) -> Self {
        Self {
            card_id: req.card_id,
            amount: req.amount,
            merchant_name: req
                .merchant_name
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_MERCHANT.to_string()),
        }
    }
}
