//! Settlement orchestrator
//!
//! Entry points for the scheduler and the admin runner:
//!
//! - [`SettlementService::run_daily_sync`] lists the newest reports and runs
//!   each one through [`SettlementService::process_report`]
//! - [`SettlementService::run_late_allocation_sweep`] revisits reports that
//!   already have a final posting and attaches documents that arrived late
//!
//! Every report is its own unit of work: failures are logged with their
//! category and the batch moves on. A fatal failure disables the sync until
//! an operator re-enables it.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::Instrument;

use super::allocation_service::{AllocationService, AllocationSummary};
use super::credit_note_service::CreditNoteService;
use super::fx_service::FxService;
use super::posting_builder::{BuildDiagnostics, PostingBuilder};
use crate::config::{ConfigError, SettlementSettings};
use crate::error::{ErrorCategory, SettlementError, SettlementResult};
use crate::ingest::{FetchSettings, ReportFetcher};
use crate::jobs::{FinalizeJob, JobLane, JobQueue};
use crate::ledger::LedgerPort;
use crate::marketplace::ReportSource;
use crate::models::{PostingId, PostingStatus, ReportSummary, SettlementReport};
use crate::retry::retry_locked;
use crate::validation::validate_draft;

/// What processing one report amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// First pass: provisional posting stored and finalize queued
    Posted {
        posting_id: PostingId,
        lines: usize,
        lane: JobLane,
        diagnostics: BuildDiagnostics,
    },
    /// A provisional posting already existed; finalize re-queued
    DraftRequeued { posting_id: PostingId },
    /// Report already final; late documents attached
    LateAllocated(AllocationSummary),
    /// No net transfer row
    NothingToPost,
    /// Settlement period ends before the configured cut-off
    BeforeCutoff,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportFailure {
    pub report_id: String,
    pub category: ErrorCategory,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    pub listed: usize,
    pub outcomes: Vec<(String, ReportOutcome)>,
    pub failures: Vec<ReportFailure>,
    /// Set when a fatal failure switched the sync off during this run
    pub sync_disabled: bool,
}

impl SyncSummary {
    pub fn posted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ReportOutcome::Posted { .. }))
            .count()
    }
}

/// Earliest report creation time to list, or `None` when the cut-off lies
/// in the future and nothing can qualify
pub fn listing_since(settings: &SettlementSettings, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match settings.after_date {
        Some(after) if after > now.date_naive() => None,
        Some(after) => after.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
        None => Some(now - ChronoDuration::days(settings.days_back)),
    }
}

fn before_cutoff(after_date: Option<NaiveDate>, report: &SettlementReport) -> bool {
    match (after_date, report.header.settlement_end) {
        (Some(after), Some(end)) => end < after,
        _ => false,
    }
}

pub struct SettlementService {
    source: Arc<dyn ReportSource>,
    fetcher: ReportFetcher,
    ledger: Arc<dyn LedgerPort>,
    builder: PostingBuilder,
    allocation: AllocationService,
    jobs: Arc<dyn JobQueue>,
    settings: Arc<SettlementSettings>,
    sync_enabled: AtomicBool,
}

impl SettlementService {
    pub fn new(
        settings: Arc<SettlementSettings>,
        source: Arc<dyn ReportSource>,
        fetch_settings: FetchSettings,
        ledger: Arc<dyn LedgerPort>,
        fx: Arc<FxService>,
        jobs: Arc<dyn JobQueue>,
    ) -> Self {
        let fetcher = ReportFetcher::new(source.clone(), fetch_settings);
        let builder = PostingBuilder::new(settings.clone(), ledger.clone(), fx);
        let credit_notes = CreditNoteService::new(ledger.clone(), settings.accounts.clone());
        let allocation = AllocationService::new(ledger.clone(), credit_notes);
        Self {
            source,
            fetcher,
            ledger,
            builder,
            allocation,
            jobs,
            settings,
            sync_enabled: AtomicBool::new(true),
        }
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    pub fn enable_sync(&self) {
        if !self.sync_enabled.swap(true, Ordering::SeqCst) {
            tracing::info!("Settlement sync re-enabled");
        }
    }

    fn disable_sync(&self, reason: &str) {
        self.sync_enabled.store(false, Ordering::SeqCst);
        tracing::error!(
            category = %ErrorCategory::Fatal,
            reason = %reason,
            "Settlement sync disabled until re-enabled"
        );
    }

    /// Process the newest reports, newest first
    pub async fn run_daily_sync(&self, now: DateTime<Utc>) -> SettlementResult<SyncSummary> {
        let reports = self.list_candidates(now).await?;
        let reports: Vec<ReportSummary> = reports.into_iter().take(self.settings.reports_per_run).collect();
        tracing::info!(count = reports.len(), "Starting settlement sync");
        self.run_batch(&reports).await
    }

    /// Revisit already-final reports in the listing window
    pub async fn run_late_allocation_sweep(&self, now: DateTime<Utc>) -> SettlementResult<SyncSummary> {
        let mut finals = Vec::new();
        for summary in self.list_candidates(now).await? {
            if self
                .ledger
                .find_posting(&summary.report_id, PostingStatus::Final)
                .await?
                .is_some()
            {
                finals.push(summary);
            }
        }
        tracing::info!(count = finals.len(), "Starting late allocation sweep");
        self.run_batch(&finals).await
    }

    async fn list_candidates(&self, now: DateTime<Utc>) -> SettlementResult<Vec<ReportSummary>> {
        if !self.is_sync_enabled() {
            tracing::warn!("Settlement sync is disabled, skipping run");
            return Err(ConfigError::SyncDisabled.into());
        }
        let Some(since) = listing_since(&self.settings, now) else {
            tracing::info!(after_date = ?self.settings.after_date, "Cut-off date is in the future, nothing to list");
            return Ok(Vec::new());
        };

        let mut reports = match self.source.list_reports(since).await {
            Ok(reports) => reports,
            Err(e) => {
                if e.category().is_fatal() {
                    self.disable_sync(&e.to_string());
                }
                return Err(e.into());
            }
        };
        reports.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        Ok(reports)
    }

    async fn run_batch(&self, reports: &[ReportSummary]) -> SettlementResult<SyncSummary> {
        let mut summary = SyncSummary {
            listed: reports.len(),
            ..Default::default()
        };

        for (idx, report) in reports.iter().enumerate() {
            let span = tracing::info_span!("process_settlement_report", report_id = %report.report_id);
            let result = self.process_report(report).instrument(span).await;

            match result {
                Ok(outcome) => summary.outcomes.push((report.report_id.clone(), outcome)),
                Err(e) => {
                    let category = e.category();
                    tracing::error!(
                        report_id = %report.report_id,
                        category = %category,
                        error = %e,
                        "Settlement report failed, skipping"
                    );
                    summary.failures.push(ReportFailure {
                        report_id: report.report_id.clone(),
                        category,
                        message: e.to_string(),
                    });
                    // The rest of the batch still runs; the flag stops the next run.
                    if category.is_fatal() && !summary.sync_disabled {
                        self.disable_sync(&e.to_string());
                        summary.sync_disabled = true;
                    }
                }
            }

            if idx + 1 < reports.len() {
                tokio::time::sleep(self.settings.report_spacing).await;
            }
        }

        tracing::info!(
            listed = summary.listed,
            posted = summary.posted(),
            failed = summary.failures.len(),
            "Settlement batch finished"
        );
        Ok(summary)
    }

    /// Fetch one listed report and process it
    pub async fn process_report(&self, summary: &ReportSummary) -> SettlementResult<ReportOutcome> {
        let report = self.fetcher.fetch(summary).await?;
        self.process_fetched(&report).await
    }

    /// First pass, draft re-use or late allocation, depending on what the
    /// ledger already holds for the report
    pub async fn process_fetched(&self, report: &SettlementReport) -> SettlementResult<ReportOutcome> {
        let report_id = report.report_id();

        if before_cutoff(self.settings.after_date, report) {
            tracing::info!(
                report_id = %report_id,
                settlement_end = ?report.header.settlement_end,
                "Settlement ends before cut-off date, skipping"
            );
            return Ok(ReportOutcome::BeforeCutoff);
        }

        if let Some(posting) = self.ledger.find_posting(report_id, PostingStatus::Final).await? {
            let Some(prepared) = self.builder.prepare(report).await? else {
                return Ok(ReportOutcome::NothingToPost);
            };
            let allocated = self.allocation.allocate_late(&posting, &prepared).await?;
            return Ok(ReportOutcome::LateAllocated(allocated));
        }

        if let Some(draft) = self
            .ledger
            .find_posting(report_id, PostingStatus::Provisional)
            .await?
        {
            let lane = self.lane_for(draft.lines.len());
            self.enqueue_finalize(draft.id, report_id, lane).await?;
            tracing::info!(
                report_id = %report_id,
                posting_id = %draft.id,
                "Provisional posting exists, finalize re-queued"
            );
            return Ok(ReportOutcome::DraftRequeued { posting_id: draft.id });
        }

        let Some(built) = self.builder.build(report).await? else {
            return Ok(ReportOutcome::NothingToPost);
        };
        validate_draft(&built.draft, self.settings.currency_precision)?;

        let lines = built.draft.lines.len();
        let lane = self.lane_for(lines);
        let context = format!("create_posting {}", report_id);
        let posting_id = retry_locked(|| self.ledger.create_posting(built.draft.clone()), &context).await?;
        self.enqueue_finalize(posting_id, report_id, lane).await?;

        tracing::info!(
            report_id = %report_id,
            posting_id = %posting_id,
            lines,
            lane = %lane,
            "Provisional posting created"
        );
        Ok(ReportOutcome::Posted {
            posting_id,
            lines,
            lane,
            diagnostics: built.diagnostics,
        })
    }

    fn lane_for(&self, lines: usize) -> JobLane {
        JobLane::for_line_count(lines, self.settings.long_lane_line_threshold)
    }

    async fn enqueue_finalize(&self, posting_id: PostingId, report_id: &str, lane: JobLane) -> SettlementResult<()> {
        self.jobs
            .enqueue(FinalizeJob {
                posting_id,
                report_id: report_id.to_string(),
                lane,
            })
            .await
            .map_err(SettlementError::from)
    }
}
