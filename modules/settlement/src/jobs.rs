//! Finalize job queue and worker
//!
//! Builders enqueue one [`FinalizeJob`] per provisional posting. The worker
//! consumes the queue on its own task, runs each job under retry with a
//! lane-specific timeout, and logs jobs that exhaust their retries as
//! dead-lettered.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::models::PostingId;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::services::finalize_service::{FinalizeError, FinalizeOutcome, FinalizeService};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Finalize of {posting_id} timed out after {secs}s on the {lane} lane")]
    Timeout {
        posting_id: PostingId,
        lane: JobLane,
        secs: u64,
    },

    #[error(transparent)]
    Finalize(#[from] FinalizeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobLane {
    Default,
    /// Postings with many lines
    Long,
}

impl JobLane {
    pub fn for_line_count(lines: usize, long_threshold: usize) -> Self {
        if lines > long_threshold {
            JobLane::Long
        } else {
            JobLane::Default
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            JobLane::Default => Duration::from_secs(300),
            JobLane::Long => Duration::from_secs(3600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobLane::Default => "default",
            JobLane::Long => "long",
        }
    }
}

impl std::fmt::Display for JobLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeJob {
    pub posting_id: PostingId,
    pub report_id: String,
    pub lane: JobLane,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: FinalizeJob) -> Result<(), JobError>;
}

/// Queue backed by an unbounded tokio channel
#[derive(Clone)]
pub struct InMemoryJobQueue {
    tx: UnboundedSender<FinalizeJob>,
}

impl InMemoryJobQueue {
    pub fn new() -> (Self, UnboundedReceiver<FinalizeJob>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: FinalizeJob) -> Result<(), JobError> {
        tracing::debug!(
            posting_id = %job.posting_id,
            report_id = %job.report_id,
            lane = %job.lane,
            "Enqueued finalize job"
        );
        self.tx.send(job).map_err(|_| JobError::QueueClosed)
    }
}

/// Spawn the finalize consumer; the task ends when every sender is dropped
pub fn start_finalize_worker(
    mut rx: UnboundedReceiver<FinalizeJob>,
    service: Arc<FinalizeService>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Starting finalize worker");

        let retry_config = RetryConfig::default();

        while let Some(job) = rx.recv().await {
            let span = tracing::info_span!(
                "finalize_posting",
                posting_id = %job.posting_id,
                report_id = %job.report_id,
                lane = %job.lane
            );

            async {
                let result = retry_with_backoff(
                    || run_job(&service, &job),
                    &retry_config,
                    "finalize_worker",
                )
                .await;

                if let Err(e) = result {
                    tracing::error!(
                        error = %e,
                        retry_count = retry_config.max_attempts,
                        "Finalize job failed after retries, dead-lettered"
                    );
                }
            }
            .instrument(span)
            .await;
        }

        tracing::warn!("Finalize worker stopped");
    })
}

async fn run_job(service: &FinalizeService, job: &FinalizeJob) -> Result<FinalizeOutcome, JobError> {
    let timeout = job.lane.timeout();
    match tokio::time::timeout(timeout, service.finalize(job.posting_id)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(JobError::Timeout {
            posting_id: job.posting_id,
            lane: job.lane,
            secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountMap, SettlementSettings};
    use crate::ledger::{InMemoryLedger, LedgerPort};
    use crate::models::{PostingDraft, PostingLine, PostingStatus};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::{BTreeMap, HashMap};

    fn settings() -> Arc<SettlementSettings> {
        Arc::new(SettlementSettings {
            base_currency: "USD".into(),
            currency_precision: 2,
            accounts: AccountMap {
                currencies: HashMap::new(),
                reimbursement: "Reimbursements".into(),
                misc_fees: "Misc Fees".into(),
                round_off: "Round Off".into(),
                bank: "Bank".into(),
                special_fees: BTreeMap::new(),
                charge_account_prefix: "Amazon".into(),
            },
            reports_per_run: 4,
            days_back: 90,
            after_date: None,
            report_spacing: Duration::ZERO,
            misc_fee_alert_threshold: dec!(50),
            large_imbalance_threshold: Decimal::ONE,
            long_lane_line_threshold: 200,
            clearing_lookback_days: 90,
        })
    }

    #[test]
    fn lane_depends_on_line_count() {
        assert_eq!(JobLane::for_line_count(200, 200), JobLane::Default);
        assert_eq!(JobLane::for_line_count(201, 200), JobLane::Long);
        assert!(JobLane::Long.timeout() > JobLane::Default.timeout());
    }

    #[tokio::test]
    async fn worker_confirms_queued_postings() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut draft = PostingDraft {
            report_id: "R1".into(),
            posting_date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            deposit_at: None,
            remark: String::new(),
            multi_currency: false,
            lines: vec![
                PostingLine::new("Clearing USD", "USD", Decimal::ONE).with_debit(dec!(10)),
                PostingLine::new("Debtors USD", "USD", Decimal::ONE).with_credit(dec!(10)),
            ],
        };
        draft.renumber();
        let id = ledger.create_posting(draft).await.unwrap();

        let (queue, rx) = InMemoryJobQueue::new();
        let service = Arc::new(FinalizeService::new(ledger.clone(), settings()));
        let handle = start_finalize_worker(rx, service);

        queue
            .enqueue(FinalizeJob {
                posting_id: id,
                report_id: "R1".into(),
                lane: JobLane::Default,
            })
            .await
            .unwrap();
        drop(queue);
        handle.await.unwrap();

        let posting = ledger.get_posting(id).await.unwrap().unwrap();
        assert_eq!(posting.status, PostingStatus::Final);
    }

    #[tokio::test]
    async fn enqueue_fails_once_the_worker_is_gone() {
        let (queue, rx) = InMemoryJobQueue::new();
        drop(rx);
        let err = queue
            .enqueue(FinalizeJob {
                posting_id: uuid::Uuid::new_v4(),
                report_id: "R1".into(),
                lane: JobLane::Default,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::QueueClosed));
    }
}
