//! Report fetcher
//!
//! Resolves a listed report to decoded, normalized rows. Reports that are
//! still being generated, or whose document downloads empty, are polled a
//! bounded number of times before the fetch gives up with
//! [`FetchError::NotReady`].

use std::sync::Arc;
use std::time::Duration;

use super::decode::{decode_document, DecodeError};
use super::normalize::{extract_header, parse_report_text, NormalizeError};
use crate::error::ErrorCategory;
use crate::marketplace::{MarketplaceError, ReportSource};
use crate::models::{ReportSummary, SettlementReport};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] MarketplaceError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Parse error: {0}")]
    Parse(#[from] NormalizeError),

    #[error("Report {report_id} not ready after {attempts} polls")]
    NotReady { report_id: String, attempts: u32 },
}

impl FetchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::Network(e) => e.category(),
            FetchError::Decode(_) | FetchError::Parse(_) => ErrorCategory::DataQuality,
            FetchError::NotReady { .. } => ErrorCategory::Transient,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    /// Pause between the document metadata call and the download
    pub document_spacing: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            poll_attempts: 7,
            poll_interval: Duration::from_secs(3),
            document_spacing: Duration::from_millis(1500),
        }
    }
}

impl FetchSettings {
    /// No waiting at all; for tests and replays from local sources
    pub fn immediate() -> Self {
        Self {
            poll_attempts: 7,
            poll_interval: Duration::ZERO,
            document_spacing: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
pub struct ReportFetcher {
    source: Arc<dyn ReportSource>,
    settings: FetchSettings,
}

impl ReportFetcher {
    pub fn new(source: Arc<dyn ReportSource>, settings: FetchSettings) -> Self {
        Self { source, settings }
    }

    pub async fn fetch(&self, summary: &ReportSummary) -> Result<SettlementReport, FetchError> {
        let summary = self.wait_until_ready(summary).await?;
        let Some(document_id) = summary.document_id.clone() else {
            return Err(FetchError::NotReady {
                report_id: summary.report_id.clone(),
                attempts: 0,
            });
        };

        // An empty document is treated like a report still being generated.
        for attempt in 1..=self.settings.poll_attempts {
            let document = self.source.get_document(&document_id).await?;
            tokio::time::sleep(self.settings.document_spacing).await;

            let raw = self.source.download(&document.url).await?;
            let text = decode_document(&document, raw)?;
            let rows = parse_report_text(&text)?;
            if !rows.is_empty() {
                let header = extract_header(&rows);
                tracing::info!(
                    report_id = %summary.report_id,
                    rows = rows.len(),
                    "Fetched settlement report"
                );
                return Ok(SettlementReport { summary, header, rows });
            }

            tracing::debug!(
                report_id = %summary.report_id,
                attempt,
                "Report document has no rows yet"
            );
            if attempt < self.settings.poll_attempts {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }

        Err(FetchError::NotReady {
            report_id: summary.report_id.clone(),
            attempts: self.settings.poll_attempts,
        })
    }

    async fn wait_until_ready(&self, summary: &ReportSummary) -> Result<ReportSummary, FetchError> {
        if summary.is_done() {
            return Ok(summary.clone());
        }

        for attempt in 1..=self.settings.poll_attempts {
            let current = self.source.get_report(&summary.report_id).await?;
            if current.is_done() {
                return Ok(current);
            }
            tracing::debug!(
                report_id = %summary.report_id,
                attempt,
                status = ?current.processing_status,
                "Report not ready yet"
            );
            if attempt < self.settings.poll_attempts {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }

        Err(FetchError::NotReady {
            report_id: summary.report_id.clone(),
            attempts: self.settings.poll_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketplace::MarketplaceResult;
    use crate::models::ReportDocument;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct PollingSource {
        ready_after: u32,
        polls: AtomicU32,
        empty_downloads: u32,
        downloads: AtomicU32,
    }

    impl PollingSource {
        fn new(ready_after: u32) -> Self {
            Self {
                ready_after,
                polls: AtomicU32::new(0),
                empty_downloads: 0,
                downloads: AtomicU32::new(0),
            }
        }

        fn empty_first(empty_downloads: u32) -> Self {
            Self {
                empty_downloads,
                ..Self::new(0)
            }
        }
    }

    #[async_trait]
    impl ReportSource for PollingSource {
        async fn list_reports(&self, _: DateTime<Utc>) -> MarketplaceResult<Vec<ReportSummary>> {
            Ok(Vec::new())
        }

        async fn get_report(&self, report_id: &str) -> MarketplaceResult<ReportSummary> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut summary = ReportSummary::new(report_id, "DOC-1");
            if n < self.ready_after {
                summary.processing_status = Some("IN_PROGRESS".into());
                summary.document_id = None;
            }
            Ok(summary)
        }

        async fn get_document(&self, document_id: &str) -> MarketplaceResult<ReportDocument> {
            Ok(ReportDocument {
                document_id: document_id.to_string(),
                url: "mem://doc".into(),
                encryption_details: None,
                compression_algorithm: None,
            })
        }

        async fn download(&self, _: &str) -> MarketplaceResult<Vec<u8>> {
            let n = self.downloads.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.empty_downloads {
                return Ok(b"transaction-type\tamount\n".to_vec());
            }
            Ok(b"transaction-type\tamount\norder\t1.50\n".to_vec())
        }
    }

    fn pending(id: &str) -> ReportSummary {
        let mut summary = ReportSummary::new(id, "DOC-1");
        summary.processing_status = Some("IN_QUEUE".into());
        summary.document_id = None;
        summary
    }

    #[tokio::test]
    async fn polls_until_done() {
        let source = Arc::new(PollingSource::new(3));
        let fetcher = ReportFetcher::new(source.clone(), FetchSettings::immediate());

        let report = fetcher.fetch(&pending("R1")).await.unwrap();
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].transaction_type, "order");
        assert_eq!(source.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_seven_polls() {
        let source = Arc::new(PollingSource::new(100));
        let fetcher = ReportFetcher::new(source.clone(), FetchSettings::immediate());

        let err = fetcher.fetch(&pending("R1")).await.unwrap_err();
        assert!(matches!(err, FetchError::NotReady { attempts: 7, .. }));
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert_eq!(source.polls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn done_reports_skip_polling() {
        let source = Arc::new(PollingSource::new(100));
        let fetcher = ReportFetcher::new(source.clone(), FetchSettings::immediate());

        fetcher.fetch(&ReportSummary::new("R1", "DOC-1")).await.unwrap();
        assert_eq!(source.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_documents_are_downloaded_again() {
        let source = Arc::new(PollingSource::empty_first(2));
        let fetcher = ReportFetcher::new(source.clone(), FetchSettings::immediate());

        let report = fetcher.fetch(&ReportSummary::new("R1", "DOC-1")).await.unwrap();
        assert_eq!(report.rows.len(), 1);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn always_empty_documents_are_not_ready() {
        let source = Arc::new(PollingSource::empty_first(u32::MAX));
        let fetcher = ReportFetcher::new(source.clone(), FetchSettings::immediate());

        let err = fetcher.fetch(&ReportSummary::new("R1", "DOC-1")).await.unwrap_err();
        assert!(matches!(err, FetchError::NotReady { attempts: 7, .. }));
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert_eq!(source.downloads.load(Ordering::SeqCst), 7);
        assert_eq!(source.polls.load(Ordering::SeqCst), 0);
    }
}
