//! Application configuration
//!
//! Centralized configuration management using the `config` crate.
//! Values are layered: built-in defaults, optional `config/default` and
//! `config/{RUN_MODE}` files, then `CARDLEDGER__SECTION__KEY` environment
//! variables.

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub replenishment: ReplenishmentConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub referral: ReferralConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    num_cpus::get()
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a ledger mutation may wait for an account row lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Apply embedded migrations at startup
    #[serde(default)]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    20
}

fn default_lock_timeout() -> u64 {
    5000
}

impl DatabaseConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Authorization policy knobs
#[derive(Debug, Deserialize, Clone)]
pub struct BillingConfig {
    /// Consecutive failed authorizations after which a card is blocked
    #[serde(default = "default_fraud_threshold")]
    pub fraud_threshold: i32,

    /// Fee percentage used when an account has no grade record yet
    #[serde(default = "default_fee_percent")]
    pub default_fee_percent: Decimal,

    /// Flat fee reported on every declined authorization
    #[serde(default = "default_decline_fee")]
    pub decline_fee: Decimal,
}

fn default_fraud_threshold() -> i32 {
    3
}

fn default_fee_percent() -> Decimal {
    Decimal::new(670, 2)
}

fn default_decline_fee() -> Decimal {
    Decimal::new(50, 2)
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            fraud_threshold: default_fraud_threshold(),
            default_fee_percent: default_fee_percent(),
            decline_fee: default_decline_fee(),
        }
    }
}

/// Auto-replenishment scheduler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReplenishmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between scans
    #[serde(default = "default_replenish_interval")]
    pub interval_secs: u64,

    /// Seconds to wait after startup before the first scan
    #[serde(default = "default_replenish_delay")]
    pub initial_delay_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_replenish_interval() -> u64 {
    300
}

fn default_replenish_delay() -> u64 {
    60
}

impl ReplenishmentConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

impl Default for ReplenishmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_replenish_interval(),
            initial_delay_secs: default_replenish_delay(),
        }
    }
}

/// Provider webhook gate configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Allowed source addresses, exact or CIDR. Empty admits everything.
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Shared HMAC-SHA256 secret. `None` disables signature checks.
    #[serde(default)]
    pub secret: Option<String>,

    /// Header carrying the hex signature
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    /// Read the client address from X-Forwarded-For / X-Real-IP
    #[serde(default = "default_true")]
    pub trust_forwarded_for: bool,
}

fn default_signature_header() -> String {
    "X-Provider-Signature".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            allowed_ips: Vec::new(),
            secret: None,
            signature_header: default_signature_header(),
            trust_forwarded_for: true,
        }
    }
}

/// Card-issuing provider API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_url")]
    pub api_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Seconds between card balance sweeps; 0 disables the sweep
    #[serde(default)]
    pub sync_interval_secs: u64,
}

fn default_provider_url() -> String {
    "https://api.wallester.com/v1".to_string()
}

fn default_provider_timeout() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: default_provider_url(),
            api_key: None,
            timeout_secs: default_provider_timeout(),
            sync_interval_secs: 0,
        }
    }
}

/// Referral revenue-share configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ReferralConfig {
    #[serde(default = "default_revshare_percent")]
    pub revshare_percent: Decimal,
}

fn default_revshare_percent() -> Decimal {
    Decimal::from(5)
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            revshare_percent: default_revshare_percent(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config files
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("database.max_connections", 20)?
            .set_default("database.lock_timeout_ms", 5000)?
            .set_default("database.run_migrations", false)?
            .set_default("billing.fraud_threshold", 3)?
            .set_default("billing.default_fee_percent", "6.70")?
            .set_default("billing.decline_fee", "0.50")?
            .set_default("replenishment.enabled", true)?
            .set_default("replenishment.interval_secs", 300)?
            .set_default("replenishment.initial_delay_secs", 60)?
            .set_default("webhook.allowed_ips", Vec::<String>::new())?
            .set_default("webhook.signature_header", "X-Provider-Signature")?
            .set_default("webhook.trust_forwarded_for", true)?
            .set_default("provider.timeout_secs", 30)?
            .set_default("provider.sync_interval_secs", 0)?
            .set_default("referral.revshare_percent", "5")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("CARDLEDGER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("webhook.allowed_ips")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get the server bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
