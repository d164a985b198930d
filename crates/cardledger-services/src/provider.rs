//! HTTP client for the card-issuing provider API

use async_trait::async_trait;
use cardledger_core::{config::ProviderConfig, traits::ProviderClient, AppError, AppResult};
use reqwest::{Client, ClientBuilder};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, instrument};

/// `GET /cards/{id}/balance` response body
#[derive(Debug, Deserialize)]
struct BalanceResponse {
    success: bool,
    #[serde(default)]
    balance: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpProviderClient {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl HttpProviderClient {
    /// Create a client with a bearer API key
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root (e.g. "https://api.example.com/v1")
    /// * `api_key` - Bearer token
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> AppResult<Self> {
        let http_client = ClientBuilder::new()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Build from config; `None` when no API key is configured
    pub fn from_config(config: &ProviderConfig) -> AppResult<Option<Self>> {
        match config.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Ok(Some(Self::new(
                &config.api_url,
                key,
                Duration::from_secs(config.timeout_secs),
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    #[instrument(skip(self))]
    async fn card_balance(&self, provider_card_id: &str) -> AppResult<Decimal> {
        let url = format!("{}/cards/{}/balance", self.base_url, provider_card_id);
        debug!("Provider request: GET {}", url);

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Provider(format!("Request timed out: {}", e))
                } else {
                    AppError::Provider(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Provider(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            error!("Provider HTTP error: status={} body={}", status, body);
            return Err(AppError::Provider(format!(
                "API error (status {}): {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: BalanceResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Provider(format!("Failed to parse response: {}", e)))?;

        if !parsed.success {
            return Err(AppError::Provider(
                parsed.error.unwrap_or_else(|| "unknown provider error".to_string()),
            ));
        }

        let raw = parsed
            .balance
            .ok_or_else(|| AppError::Provider("Response has no balance".to_string()))?;

        Decimal::from_str(&raw)
            .map_err(|e| AppError::Provider(format!("Invalid balance format '{}': {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_requires_key() {
        let config = ProviderConfig::default();
        assert!(HttpProviderClient::from_config(&config).unwrap().is_none());

        let config = ProviderConfig {
            api_key: Some("secret".to_string()),
            api_url: "https://provider.test/v1/".to_string(),
            ..Default::default()
        };
        let client = HttpProviderClient::from_config(&config).unwrap().unwrap();
        assert_eq!(client.base_url, "https://provider.test/v1");
    }

    #[test]
    fn test_balance_response_shape() {
        let parsed: BalanceResponse =
            serde_json::from_str(r#"{"success":false,"error":"card frozen"}"#).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_deref(), Some("card frozen"));
        assert!(parsed.balance.is_none());
    }
}
