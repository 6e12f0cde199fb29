//! Bearer tokens for the marketplace API
//!
//! The refresh-token grant yields a short-lived access token. It is cached
//! with an explicit expiry and renewed shortly before it lapses, or
//! immediately after the API rejects it.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::error::{MarketplaceError, MarketplaceResult};
use crate::config::MarketplaceConfig;

/// Renew this long before the recorded expiry
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > now
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token, renewed if stale
    async fn access_token(&self) -> MarketplaceResult<String>;

    /// Drop the cached token so the next call renews it
    async fn invalidate(&self);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// LWA refresh-token grant
pub struct RefreshTokenProvider {
    http_client: Client,
    auth_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<AccessToken>>,
}

impl RefreshTokenProvider {
    pub fn new(config: &MarketplaceConfig, http_client: Client) -> Self {
        Self {
            http_client,
            auth_url: config.auth_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            refresh_token: config.refresh_token.clone(),
            cached: Mutex::new(None),
        }
    }

    async fn request_token(&self) -> MarketplaceResult<AccessToken> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http_client
            .post(&self.auth_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| MarketplaceError::HttpError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            if status.is_server_error() {
                return Err(MarketplaceError::ApiError {
                    status_code: status.as_u16(),
                    message: body,
                });
            }
            return Err(MarketplaceError::AuthError(format!("{}: {}", status.as_u16(), body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| MarketplaceError::ParseError(e.to_string()))?;

        tracing::debug!(expires_in = token.expires_in, "Obtained marketplace access token");

        Ok(AccessToken {
            value: token.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in),
        })
    }
}

#[async_trait]
impl TokenProvider for RefreshTokenProvider {
    async fn access_token(&self) -> MarketplaceResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

/// Fixed token, for tests and sandbox endpoints
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> MarketplaceResult<String> {
        Ok(self.0.clone())
    }

    async fn invalidate(&self) {}
}
