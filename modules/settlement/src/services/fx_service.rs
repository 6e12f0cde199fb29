//! Exchange-rate lookups
//!
//! Lookup order for `(from, to, date)`:
//! 1. identical currencies resolve to 1
//! 2. cached result (24h TTL)
//! 3. the provider, retried with backoff on transient failures
//! 4. the provider for the prior day
//! 5. the most recent manually recorded rate on or before the date
//!
//! When every step comes up empty the lookup fails with
//! [`FxError::MissingRate`]. A missing rate is never defaulted to 1.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use moka::future::Cache;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ErrorCategory;
use crate::ledger::{LedgerError, LedgerResult};
use crate::retry::{retry_when, RetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum FxError {
    #[error("FX provider unavailable: {0}")]
    Unavailable(String),

    #[error("FX provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("No exchange rate for {from}->{to} on {date}; record a manual rate")]
    MissingRate { from: String, to: String, date: NaiveDate },

    #[error("Manual rate lookup failed: {0}")]
    Ledger(#[from] LedgerError),
}

impl FxError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FxError::Unavailable(_))
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FxError::Unavailable(_) => ErrorCategory::Transient,
            FxError::InvalidResponse(_) => ErrorCategory::DataQuality,
            FxError::MissingRate { .. } => ErrorCategory::BusinessRule,
            FxError::Ledger(e) => e.category(),
        }
    }
}

pub type FxResult<T> = Result<T, FxError>;

/// Remote exchange-rate source
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Rate converting one unit of `from` into `to` on `date`; `None` when
    /// the provider has no rate for that day
    async fn fetch_rate(&self, from: &str, to: &str, date: NaiveDate) -> FxResult<Option<Decimal>>;
}

/// Operator-maintained exchange rates
#[async_trait]
pub trait ManualRateBook: Send + Sync {
    async fn latest_manual_rate(&self, from: &str, to: &str, on_or_before: NaiveDate) -> LedgerResult<Option<Decimal>>;
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    #[serde(default)]
    rates: HashMap<String, Decimal>,
}

/// Rate provider speaking the Frankfurter-style `/{date}?from=&to=` API
pub struct HttpRateProvider {
    base_url: String,
    client: Client,
}

impl HttpRateProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(base_url, client)
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn fetch_rate(&self, from: &str, to: &str, date: NaiveDate) -> FxResult<Option<Decimal>> {
        let url = format!("{}/{}", self.base_url, date.format("%Y-%m-%d"));
        let response = self
            .client
            .get(&url)
            .query(&[("from", from), ("to", to)])
            .send()
            .await
            .map_err(|e| FxError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 422 {
            return Ok(None);
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FxError::Unavailable(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(FxError::InvalidResponse(format!("HTTP {}", status.as_u16())));
        }

        let body: RatesResponse = response
            .json()
            .await
            .map_err(|e| FxError::InvalidResponse(e.to_string()))?;
        Ok(body
            .rates
            .get(&to.to_uppercase())
            .copied()
            .filter(|rate| *rate > Decimal::ZERO))
    }
}

/// Cached rate lookups with the prior-day and manual fallbacks
pub struct FxService {
    provider: Arc<dyn RateProvider>,
    manual: Arc<dyn ManualRateBook>,
    cache: Cache<(String, String, NaiveDate), Decimal>,
    retry: RetryConfig,
}

impl FxService {
    pub fn new(provider: Arc<dyn RateProvider>, manual: Arc<dyn ManualRateBook>) -> Self {
        Self {
            provider,
            manual,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(24 * 60 * 60))
                .build(),
            retry: RetryConfig::fx_lookup(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn get_rate(&self, from: &str, to: &str, date: NaiveDate) -> FxResult<Decimal> {
        let from = from.trim().to_uppercase();
        let to = to.trim().to_uppercase();
        if from == to {
            return Ok(Decimal::ONE);
        }

        let key = (from.clone(), to.clone(), date);
        if let Some(rate) = self.cache.get(&key).await {
            return Ok(rate);
        }

        let rate = self.resolve(&from, &to, date).await?;
        self.cache.insert(key, rate).await;
        Ok(rate)
    }

    async fn resolve(&self, from: &str, to: &str, date: NaiveDate) -> FxResult<Decimal> {
        match self.lookup(from, to, date).await {
            Ok(Some(rate)) => return Ok(rate),
            Ok(None) => {}
            Err(e) => tracing::warn!(from, to, %date, error = %e, "FX lookup failed, trying prior day"),
        }

        if let Some(prior) = date.checked_sub_signed(ChronoDuration::days(1)) {
            match self.lookup(from, to, prior).await {
                Ok(Some(rate)) => {
                    tracing::info!(from, to, %date, "Using prior-day exchange rate");
                    return Ok(rate);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(from, to, date = %prior, error = %e, "Prior-day FX lookup failed"),
            }
        }

        if let Some(rate) = self.manual.latest_manual_rate(from, to, date).await? {
            tracing::info!(from, to, %date, %rate, "Using manually recorded exchange rate");
            return Ok(rate);
        }

        tracing::error!(
            from,
            to,
            %date,
            category = %ErrorCategory::BusinessRule,
            "No exchange rate available"
        );
        Err(FxError::MissingRate {
            from: from.to_string(),
            to: to.to_string(),
            date,
        })
    }

    async fn lookup(&self, from: &str, to: &str, date: NaiveDate) -> FxResult<Option<Decimal>> {
        let context = format!("fx {}->{} {}", from, to, date);
        retry_when(
            || self.provider.fetch_rate(from, to, date),
            FxError::is_transient,
            &self.retry,
            &context,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    /// Serves rates from a table and counts calls
    struct TableProvider {
        rates: HashMap<NaiveDate, Decimal>,
        fail_with_outage: bool,
        calls: AtomicU32,
    }

    impl TableProvider {
        fn new(rates: &[(NaiveDate, Decimal)]) -> Self {
            Self {
                rates: rates.iter().copied().collect(),
                fail_with_outage: false,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RateProvider for TableProvider {
        async fn fetch_rate(&self, _: &str, _: &str, date: NaiveDate) -> FxResult<Option<Decimal>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_outage {
                return Err(FxError::Unavailable("down".into()));
            }
            Ok(self.rates.get(&date).copied())
        }
    }

    #[derive(Default)]
    struct Book(Mutex<Vec<(NaiveDate, Decimal)>>);

    #[async_trait]
    impl ManualRateBook for Book {
        async fn latest_manual_rate(&self, _: &str, _: &str, on_or_before: NaiveDate) -> LedgerResult<Option<Decimal>> {
            let rates = self.0.lock().unwrap();
            Ok(rates
                .iter()
                .filter(|(d, _)| *d <= on_or_before)
                .max_by_key(|(d, _)| *d)
                .map(|(_, r)| *r))
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_factor: 2.0,
        }
    }

    #[tokio::test]
    async fn same_currency_is_one_without_lookup() {
        let provider = Arc::new(TableProvider::new(&[]));
        let fx = FxService::new(provider.clone(), Arc::new(Book::default()));
        assert_eq!(fx.get_rate("usd", "USD", date(1)).await.unwrap(), Decimal::ONE);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn caches_successful_lookups() {
        let provider = Arc::new(TableProvider::new(&[(date(10), dec!(0.73))]));
        let fx = FxService::new(provider.clone(), Arc::new(Book::default()));

        assert_eq!(fx.get_rate("CAD", "USD", date(10)).await.unwrap(), dec!(0.73));
        assert_eq!(fx.get_rate("CAD", "USD", date(10)).await.unwrap(), dec!(0.73));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn falls_back_to_prior_day() {
        let provider = Arc::new(TableProvider::new(&[(date(9), dec!(0.71))]));
        let fx = FxService::new(provider, Arc::new(Book::default()));
        assert_eq!(fx.get_rate("CAD", "USD", date(10)).await.unwrap(), dec!(0.71));
    }

    #[tokio::test]
    async fn falls_back_to_manual_rate_during_outage() {
        let mut provider = TableProvider::new(&[]);
        provider.fail_with_outage = true;
        let provider = Arc::new(provider);
        let book = Arc::new(Book::default());
        book.0.lock().unwrap().push((date(2), dec!(0.70)));

        let fx = FxService::new(provider.clone(), book).with_retry(fast());
        assert_eq!(fx.get_rate("CAD", "USD", date(10)).await.unwrap(), dec!(0.70));
        // three attempts for the day, three for the prior day
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn missing_rate_fails_loudly() {
        let fx = FxService::new(Arc::new(TableProvider::new(&[])), Arc::new(Book::default()));
        let err = fx.get_rate("MXN", "USD", date(10)).await.unwrap_err();
        assert!(matches!(err, FxError::MissingRate { .. }));
        assert_eq!(err.category(), ErrorCategory::BusinessRule);
    }

    #[tokio::test]
    async fn http_provider_reads_rate() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/2025-03-10")
                    .query_param("from", "CAD")
                    .query_param("to", "USD");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"amount":1.0,"base":"CAD","date":"2025-03-10","rates":{"USD":0.6942}}"#);
            })
            .await;

        let provider = HttpRateProvider::new(server.base_url());
        let rate = provider.fetch_rate("CAD", "USD", date(10)).await.unwrap();
        assert_eq!(rate, Some(dec!(0.6942)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_provider_maps_server_errors_to_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/2025-03-10");
                then.status(503);
            })
            .await;

        let provider = HttpRateProvider::new(server.base_url());
        let err = provider.fetch_rate("CAD", "USD", date(10)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn http_provider_treats_not_found_as_no_rate() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/2025-03-10");
                then.status(404);
            })
            .await;

        let provider = HttpRateProvider::new(server.base_url());
        assert_eq!(provider.fetch_rate("CAD", "USD", date(10)).await.unwrap(), None);
    }
}
