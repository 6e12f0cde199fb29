//! One-shot settlement runner
//!
//! Runs a single scheduler step in the foreground and exits. Finalize jobs
//! queued by the step are drained before exit.
//!
//! # Usage
//! ```bash
//! settlement_admin sync
//! settlement_admin sweep
//! settlement_admin transfers
//! settlement_admin finalize POSTING_ID
//! ```

use chrono::Utc;
use std::env;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use settlement_rs::app::App;
use settlement_rs::config::Config;
use settlement_rs::services::settlement_service::SyncSummary;

enum Command {
    Sync,
    Sweep,
    Transfers,
    Finalize(Uuid),
}

/// Parse command-line arguments manually
struct Args {
    command: Command,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let args: Vec<String> = env::args().collect();
        let program = args.first().map(|s| s.as_str()).unwrap_or("settlement_admin");
        let usage = format!("Usage: {} <sync|sweep|transfers|finalize POSTING_ID>", program);

        let command = match (args.get(1).map(|s| s.as_str()), args.get(2)) {
            (Some("sync"), None) => Command::Sync,
            (Some("sweep"), None) => Command::Sweep,
            (Some("transfers"), None) => Command::Transfers,
            (Some("finalize"), Some(id)) => {
                Command::Finalize(Uuid::parse_str(id).map_err(|e| format!("Invalid posting id: {}", e))?)
            }
            (Some("finalize"), None) => return Err("finalize requires a POSTING_ID".to_string()),
            _ => return Err(usage),
        };

        Ok(Args { command })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    let config = Config::from_env().expect("Failed to load configuration from environment");
    let mut app = App::build(config).await.expect("Failed to start settlement services");

    let ok = match args.command {
        Command::Sync => report(app.settlement.run_daily_sync(Utc::now()).await, "sync"),
        Command::Sweep => report(app.settlement.run_late_allocation_sweep(Utc::now()).await, "sweep"),
        Command::Transfers => match app.transfers.run(Utc::now()).await {
            Ok(summary) => {
                tracing::info!(
                    created = summary.created.len(),
                    already_transferred = summary.already_transferred,
                    not_due = summary.not_due,
                    failed = summary.failed,
                    "Clearing transfers complete"
                );
                summary.failed == 0
            }
            Err(e) => {
                tracing::error!(category = %e.category(), error = %e, "Clearing transfers failed");
                false
            }
        },
        Command::Finalize(posting_id) => match app.finalize.finalize(posting_id).await {
            Ok(outcome) => {
                tracing::info!(posting_id = %posting_id, outcome = ?outcome, "Finalize complete");
                true
            }
            Err(e) => {
                tracing::error!(posting_id = %posting_id, category = %e.category(), error = %e, "Finalize failed");
                false
            }
        },
    };

    let mut drained_ok = true;
    while let Ok(job) = app.finalize_jobs.try_recv() {
        if let Err(e) = app.finalize.finalize(job.posting_id).await {
            tracing::error!(
                posting_id = %job.posting_id,
                report_id = %job.report_id,
                category = %e.category(),
                error = %e,
                "Queued finalize failed"
            );
            drained_ok = false;
        }
    }

    if ok && drained_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report(result: settlement_rs::SettlementResult<SyncSummary>, run: &str) -> bool {
    match result {
        Ok(summary) => {
            tracing::info!(
                run = %run,
                listed = summary.listed,
                posted = summary.posted(),
                failed = summary.failures.len(),
                sync_disabled = summary.sync_disabled,
                "Run complete"
            );
            for failure in &summary.failures {
                tracing::warn!(
                    report_id = %failure.report_id,
                    category = %failure.category,
                    error = %failure.message,
                    "Report failed"
                );
            }
            summary.failures.is_empty()
        }
        Err(e) => {
            tracing::error!(run = %run, category = %e.category(), error = %e, "Run failed");
            false
        }
    }
}
