pub mod client;
pub mod error;
pub mod token;

pub use client::MarketplaceClient;
pub use error::{MarketplaceError, MarketplaceResult};
pub use token::{AccessToken, RefreshTokenProvider, StaticTokenProvider, TokenProvider};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ReportDocument, ReportSummary};

/// Remote source of settlement report files
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Settlement reports created since `created_since`, newest first
    async fn list_reports(&self, created_since: DateTime<Utc>) -> MarketplaceResult<Vec<ReportSummary>>;

    async fn get_report(&self, report_id: &str) -> MarketplaceResult<ReportSummary>;

    async fn get_document(&self, document_id: &str) -> MarketplaceResult<ReportDocument>;

    async fn download(&self, url: &str) -> MarketplaceResult<Vec<u8>>;
}
