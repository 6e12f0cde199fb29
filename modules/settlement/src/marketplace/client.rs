use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::error::{MarketplaceError, MarketplaceResult};
use super::token::TokenProvider;
use super::ReportSource;
use crate::config::MarketplaceConfig;
use crate::models::{ReportDocument, ReportSummary, SETTLEMENT_REPORT_TYPE};

const REPORTS_PATH: &str = "/reports/2021-06-30/reports";
const DOCUMENTS_PATH: &str = "/reports/2021-06-30/documents";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportPage {
    #[serde(default)]
    reports: Vec<ReportSummary>,
    #[serde(default)]
    next_token: Option<String>,
}

/// Reports API client with token renewal and rate-limit retry
#[derive(Clone)]
pub struct MarketplaceClient {
    config: Arc<MarketplaceConfig>,
    http_client: Client,
    tokens: Arc<dyn TokenProvider>,
    initial_backoff: Duration,
}

impl MarketplaceClient {
    pub fn new(config: MarketplaceConfig, tokens: Arc<dyn TokenProvider>) -> MarketplaceResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| MarketplaceError::HttpError(e.to_string()))?;

        Ok(Self::with_http_client(config, tokens, http_client))
    }

    pub fn with_http_client(config: MarketplaceConfig, tokens: Arc<dyn TokenProvider>, http_client: Client) -> Self {
        MarketplaceClient {
            config: Arc::new(config),
            http_client,
            tokens,
            initial_backoff: Duration::from_secs(1),
        }
    }

    /// Override the first retry delay (tests use zero)
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// GET a JSON resource, retrying 429/5xx/network failures and renewing
    /// the token once on 401
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> MarketplaceResult<T> {
        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);
        let mut backoff = self.initial_backoff;
        let mut renewed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let token = self.tokens.access_token().await?;
            let result = self
                .http_client
                .get(&url)
                .header("x-amz-access-token", token)
                .query(query)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    if attempt >= self.config.max_attempts {
                        return Err(MarketplaceError::HttpError(e.to_string()));
                    }
                    tracing::warn!(path = %path, attempt, error = %e, "Marketplace request failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                if !renewed {
                    tracing::info!(path = %path, "Access token rejected, renewing");
                    self.tokens.invalidate().await;
                    renewed = true;
                    continue;
                }
                let body = response.text().await.unwrap_or_default();
                return Err(MarketplaceError::AuthError(format!("{}: {}", status.as_u16(), body)));
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt >= self.config.max_attempts {
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(MarketplaceError::RateLimited { attempts: attempt });
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(MarketplaceError::ApiError {
                        status_code: status.as_u16(),
                        message: body,
                    });
                }
                let wait = retry_after(&response).unwrap_or(backoff);
                tracing::warn!(
                    path = %path,
                    status = status.as_u16(),
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "Marketplace throttled or unavailable, backing off"
                );
                tokio::time::sleep(wait).await;
                backoff = next_backoff(backoff);
                continue;
            }

            return self.handle_response(response).await;
        }
    }

    /// Handle HTTP response and convert to appropriate type or error
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> MarketplaceResult<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| MarketplaceError::ParseError(e.to_string()))
        } else {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            Err(MarketplaceError::ApiError {
                status_code: status.as_u16(),
                message: error_body,
            })
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * 2, Duration::from_secs(30))
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl ReportSource for MarketplaceClient {
    async fn list_reports(&self, created_since: DateTime<Utc>) -> MarketplaceResult<Vec<ReportSummary>> {
        let mut all_reports = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("reportTypes", SETTLEMENT_REPORT_TYPE.to_string()),
                ("processingStatuses", "DONE".to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
                ("createdSince", created_since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ];
            if let Some(token) = &next_token {
                query.push(("nextToken", token.clone()));
            }

            let page: ReportPage = self.get_json(REPORTS_PATH, &query).await?;
            all_reports.extend(page.reports);

            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) => {
                    next_token = Some(token);
                    tokio::time::sleep(self.config.page_delay).await;
                }
                None => break,
            }
        }

        all_reports.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        tracing::info!(count = all_reports.len(), "Listed settlement reports");
        Ok(all_reports)
    }

    async fn get_report(&self, report_id: &str) -> MarketplaceResult<ReportSummary> {
        self.get_json(&format!("{}/{}", REPORTS_PATH, report_id), &[]).await
    }

    async fn get_document(&self, document_id: &str) -> MarketplaceResult<ReportDocument> {
        self.get_json(&format!("{}/{}", DOCUMENTS_PATH, document_id), &[]).await
    }

    async fn download(&self, url: &str) -> MarketplaceResult<Vec<u8>> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| MarketplaceError::HttpError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MarketplaceError::ApiError {
                status_code: status.as_u16(),
                message: format!("document download failed for {}", url),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| MarketplaceError::HttpError(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
