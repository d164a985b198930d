//! Provider webhook gates and ingestion
//!
//! Pipeline, each stage a hard gate:
//!
//! 1. origin: source address on the allow-list (exact or CIDR)
//! 2. integrity: HMAC-SHA256 of the raw body matches the header signature
//! 3. idempotency: a known provider transaction id is a successful no-op
//! 4. resolution: provider card id maps to a card and its account
//! 5. effect, by event kind
//!
//! An empty allow-list or a missing secret disables the respective gate
//! with a warning; both are insecure fallbacks for non-production use.

use crate::constants::{DEFAULT_CURRENCY, UNKNOWN_MERCHANT};
use crate::fee_tier::GradeService;
use crate::notifier::notify_account;
use crate::revshare::RevShareService;
use cardledger_core::{
    config::WebhookConfig,
    models::{Account, Card, LedgerMutation},
    traits::{LedgerStore, Notifier, ProviderClient},
    AppError, AppResult,
};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

// ==================== Origin allow-list ====================

#[derive(Debug, Clone, PartialEq, Eq)]
enum AllowEntry {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl AllowEntry {
    fn parse(raw: &str) -> AppResult<Self> {
        let raw = raw.trim();
        let invalid = || AppError::Config(format!("Invalid allow-list entry: {}", raw));

        match raw.split_once('/') {
            Some((addr, prefix)) => {
                let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(invalid());
                }
                Ok(AllowEntry::Cidr { network, prefix })
            }
            None => Ok(AllowEntry::Exact(raw.parse().map_err(|_| invalid())?)),
        }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match *self {
            AllowEntry::Exact(allowed) => allowed == ip,
            AllowEntry::Cidr { network, prefix } => match (network, ip) {
                (IpAddr::V4(net), IpAddr::V4(addr)) => {
                    let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
                    u32::from(net) & mask == u32::from(addr) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(addr)) => {
                    let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
                    u128::from(net) & mask == u128::from(addr) & mask
                }
                _ => false,
            },
        }
    }
}

/// Source addresses allowed to deliver webhooks
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    entries: Vec<AllowEntry>,
}

impl IpAllowList {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> AppResult<Self> {
        let entries = entries
            .iter()
            .map(AsRef::<str>::as_ref)
            .filter(|e| !e.trim().is_empty())
            .map(AllowEntry::parse)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// An empty list admits everything
    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.entries.is_empty() || self.entries.iter().any(|e| e.matches(ip))
    }
}

/// Resolve the client address: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the peer address
pub fn client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<IpAddr>,
    trust_forwarded: bool,
) -> Option<IpAddr> {
    if trust_forwarded {
        let forwarded = forwarded_for
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }

        let real = real_ip.and_then(|v| v.trim().parse().ok());
        if real.is_some() {
            return real;
        }
    }
    peer
}

// ==================== Gates ====================

/// Origin and integrity checks for inbound provider webhooks
pub struct WebhookGuard {
    allow_list: IpAllowList,
    secret: Option<String>,
}

impl WebhookGuard {
    pub fn new(allow_list: IpAllowList, secret: Option<String>) -> Self {
        let secret = secret.filter(|s| !s.is_empty());

        if allow_list.is_empty() {
            warn!("Webhook IP allow-list is empty, accepting webhooks from any address");
        }
        if secret.is_none() {
            warn!("Webhook secret not configured, signature verification is disabled");
        }

        Self { allow_list, secret }
    }

    pub fn from_config(config: &WebhookConfig) -> AppResult<Self> {
        Ok(Self::new(
            IpAllowList::parse(config.allowed_ips.as_slice())?,
            config.secret.clone(),
        ))
    }

    pub fn check_origin(&self, ip: Option<IpAddr>) -> AppResult<()> {
        if self.allow_list.is_empty() {
            return Ok(());
        }

        match ip {
            Some(ip) if self.allow_list.allows(ip) => Ok(()),
            Some(ip) => {
                warn!("Webhook rejected: source {} is not allowed", ip);
                Err(AppError::OriginRejected(ip.to_string()))
            }
            None => {
                warn!("Webhook rejected: source address unknown");
                Err(AppError::OriginRejected("unknown".to_string()))
            }
        }
    }

    /// Verify a lowercase hex HMAC-SHA256 of the raw body in constant time
    pub fn verify_signature(&self, body: &[u8], signature: Option<&str>) -> AppResult<()> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(());
        };

        let signature = signature.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
            warn!("Webhook rejected: signature header missing");
            AppError::InvalidSignature
        })?;

        let expected = hex::decode(signature).map_err(|_| AppError::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AppError::Config(format!("Invalid webhook secret: {}", e)))?;
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| {
            warn!("Webhook rejected: signature mismatch");
            AppError::InvalidSignature
        })
    }
}

/// Hex HMAC-SHA256 of `body`, as the provider computes it
pub fn sign(secret: &str, body: &[u8]) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ==================== Payload ====================

/// Inbound provider event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_type: String,
    /// Card id at the provider
    pub card_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub auth_code: Option<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
}

impl WebhookPayload {
    pub fn from_slice(body: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(body)
            .map_err(|e| AppError::InvalidPayload(format!("Malformed webhook body: {}", e)))
    }

    /// Provider transaction id, empty treated as absent
    pub fn tx_id(&self) -> Option<&str> {
        self.transaction_id.as_deref().filter(|id| !id.is_empty())
    }

    fn merchant(&self) -> &str {
        self.merchant_name
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(UNKNOWN_MERCHANT)
    }

    fn currency(&self) -> &str {
        self.currency
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CURRENCY)
    }

    fn positive_amount(&self) -> AppResult<Decimal> {
        match self.amount {
            Some(amount) if amount > Decimal::ZERO => Ok(amount),
            Some(amount) => Err(AppError::InvalidPayload(format!(
                "Amount must be positive, got {}",
                amount
            ))),
            None => Err(AppError::InvalidPayload(format!(
                "Event {} requires an amount",
                self.event_type
            ))),
        }
    }

    fn is_settled(&self) -> bool {
        matches!(
            self.status.as_deref().map(str::to_lowercase).as_deref(),
            Some("approved") | Some("completed")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    ThreeDs,
    /// transaction / capture / authorization, applied once settled
    Capture,
    /// Always applied
    PaymentSuccess,
    Refund,
    BalanceUpdate,
    Unknown,
}

impl EventKind {
    fn parse(event_type: &str) -> Self {
        match event_type {
            "3ds_authentication" => EventKind::ThreeDs,
            "transaction" | "capture" | "authorization" => EventKind::Capture,
            "payment_success" => EventKind::PaymentSuccess,
            "refund" | "reversal" => EventKind::Refund,
            "balance_update" => EventKind::BalanceUpdate,
            _ => EventKind::Unknown,
        }
    }
}

/// What happened to an accepted webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Applied; carries the event type
    Processed(String),
    /// Already recorded; carries the provider transaction id
    Duplicate(String),
    /// Acknowledged without effect; carries the reason
    Ignored(String),
}

// ==================== Ingestion ====================

pub struct WebhookIngestor {
    ledger: Arc<dyn LedgerStore>,
    grades: Arc<GradeService>,
    notifier: Arc<dyn Notifier>,
    provider: Option<Arc<dyn ProviderClient>>,
    revshare: Option<Arc<RevShareService>>,
}

impl WebhookIngestor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        grades: Arc<GradeService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ledger,
            grades,
            notifier,
            provider: None,
            revshare: None,
        }
    }

    /// Fetch balances from the provider when a balance_update has no amount
    pub fn with_provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Credit referrers on settled charges
    pub fn with_revshare(mut self, revshare: Arc<RevShareService>) -> Self {
        self.revshare = Some(revshare);
        self
    }

    /// Apply one provider event after the gates have passed
    #[instrument(skip(self, payload), fields(event = %payload.event_type, card = %payload.card_id))]
    pub async fn ingest(&self, payload: &WebhookPayload) -> AppResult<WebhookOutcome> {
        if let Some(tx_id) = payload.tx_id() {
            if self.ledger.provider_tx_exists(tx_id).await? {
                info!("Webhook duplicate: transaction_id={} already processed, skipping", tx_id);
                return Ok(WebhookOutcome::Duplicate(tx_id.to_string()));
            }
        }

        let card = self
            .ledger
            .find_card_by_provider_id(&payload.card_id)
            .await?
            .ok_or_else(|| AppError::CardNotFound(payload.card_id.clone()))?;

        let account = self
            .ledger
            .find_account(card.account_id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(card.account_id.to_string()))?;

        let result = match EventKind::parse(&payload.event_type) {
            EventKind::ThreeDs => self.three_ds(payload, &account).await,
            EventKind::Capture if !payload.is_settled() => {
                debug!(
                    "Webhook {} with status {:?} has no balance effect",
                    payload.event_type, payload.status
                );
                Ok(WebhookOutcome::Ignored(format!(
                    "status {} is not settled",
                    payload.status.as_deref().unwrap_or("missing")
                )))
            }
            EventKind::Capture | EventKind::PaymentSuccess => {
                self.capture(payload, &card, &account).await
            }
            EventKind::Refund => self.refund(payload, &card, &account).await,
            EventKind::BalanceUpdate => self.balance_update(payload, &card).await,
            EventKind::Unknown => {
                warn!("Unknown webhook event type: {}", payload.event_type);
                Ok(WebhookOutcome::Ignored(format!(
                    "unknown event type {}",
                    payload.event_type
                )))
            }
        };

        match result {
            Err(AppError::DuplicateProviderTransaction(tx_id)) => {
                info!("Webhook duplicate: transaction_id={} recorded concurrently, skipping", tx_id);
                Ok(WebhookOutcome::Duplicate(tx_id))
            }
            other => other,
        }
    }

    async fn three_ds(&self, payload: &WebhookPayload, account: &Account) -> AppResult<WebhookOutcome> {
        let Some(code) = payload.auth_code.as_deref().filter(|c| !c.is_empty()) else {
            warn!("3DS webhook received without auth_code");
            return Ok(WebhookOutcome::Ignored("missing auth code".to_string()));
        };

        notify_account(
            self.notifier.as_ref(),
            account,
            &format!(
                "Verification code: {} | Merchant: {}\n\nDo not share this code with anyone.",
                code,
                payload.merchant()
            ),
        )
        .await;

        info!("3DS code delivered for account {}", account.id);
        Ok(WebhookOutcome::Processed(payload.event_type.clone()))
    }

    async fn capture(
        &self,
        payload: &WebhookPayload,
        card: &Card,
        account: &Account,
    ) -> AppResult<WebhookOutcome> {
        let amount = payload.positive_amount()?;

        if !account.can_cover(amount) {
            warn!(
                "Insufficient funds for provider capture: required {}, available {}",
                amount, account.balance
            );
            return Err(AppError::InsufficientBalance {
                required: amount.to_string(),
                available: account.balance.to_string(),
            });
        }

        let mut mutation = LedgerMutation::capture(
            account.id,
            card.id,
            amount,
            Decimal::ZERO,
            format!(
                "Provider {} from card {}, merchant: {}",
                payload.event_type,
                payload.card_id,
                payload.merchant()
            ),
        );
        if let Some(tx_id) = payload.tx_id() {
            mutation = mutation.with_provider_tx(tx_id);
        }

        let new_balance = self.ledger.apply(mutation).await?;

        info!(
            "Webhook: deducted {} from account {} (card {}, tx_id={:?})",
            amount,
            account.id,
            card.id,
            payload.tx_id()
        );

        notify_account(
            self.notifier.as_ref(),
            account,
            &format!(
                "Charge: {} {} | Card: *{} | Merchant: {}\n\nNew balance: {}",
                amount,
                payload.currency(),
                card.last4(),
                payload.merchant(),
                new_balance
            ),
        )
        .await;

        self.grades.spawn_refresh(account.id);
        if let Some(revshare) = &self.revshare {
            revshare.reward_referrer(account.id, amount).await;
        }

        Ok(WebhookOutcome::Processed(payload.event_type.clone()))
    }

    async fn refund(
        &self,
        payload: &WebhookPayload,
        card: &Card,
        account: &Account,
    ) -> AppResult<WebhookOutcome> {
        let amount = payload.positive_amount()?;

        let mut mutation = LedgerMutation::refund(
            account.id,
            card.id,
            amount,
            format!("Provider {} for card {}", payload.event_type, payload.card_id),
        );
        if let Some(tx_id) = payload.tx_id() {
            mutation = mutation.with_provider_tx(tx_id);
        }

        let new_balance = self.ledger.apply(mutation).await?;

        info!(
            "Webhook: refunded {} to account {} (card {}, tx_id={:?})",
            amount,
            account.id,
            card.id,
            payload.tx_id()
        );

        notify_account(
            self.notifier.as_ref(),
            account,
            &format!(
                "Refund: {} {} to card *{}\n\nNew balance: {}",
                amount,
                payload.currency(),
                card.last4(),
                new_balance
            ),
        )
        .await;

        Ok(WebhookOutcome::Processed(payload.event_type.clone()))
    }

    async fn balance_update(&self, payload: &WebhookPayload, card: &Card) -> AppResult<WebhookOutcome> {
        let balance = match (payload.amount, &self.provider) {
            (Some(balance), _) => balance,
            (None, Some(provider)) => provider.card_balance(&payload.card_id).await?,
            (None, None) => {
                warn!("balance_update for card {} carries no balance", card.id);
                return Ok(WebhookOutcome::Ignored("no balance in payload".to_string()));
            }
        };

        self.ledger.sync_card_balance(card.id, balance).await?;
        Ok(WebhookOutcome::Processed(payload.event_type.clone()))
    }
}
