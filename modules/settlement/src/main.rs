use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use settlement_rs::{
    app::App,
    config::{Config, ConfigError},
    services::{ClearingTransferService, SettlementService},
    start_finalize_worker, SettlementError,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting settlement service...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        "Configuration loaded: ledger_backend={}, base_currency={}, reports_per_run={}",
        config.ledger_backend,
        config.settlement.base_currency,
        config.settlement.reports_per_run
    );

    let daily_interval = config.daily_interval;
    let hourly_interval = config.hourly_interval;

    let app = App::build(config).await.expect("Failed to start settlement services");

    let worker = start_finalize_worker(app.finalize_jobs, app.finalize.clone());

    let daily = tokio::spawn(run_daily(app.settlement.clone(), daily_interval));
    let hourly = tokio::spawn(run_hourly(app.settlement.clone(), app.transfers.clone(), hourly_interval));

    tokio::signal::ctrl_c().await.expect("Failed to listen for shutdown signal");
    tracing::info!("Shutdown signal received, stopping schedulers");

    daily.abort();
    hourly.abort();
    worker.abort();
}

async fn run_daily(settlement: Arc<SettlementService>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match settlement.run_daily_sync(Utc::now()).await {
            Ok(summary) => tracing::info!(
                listed = summary.listed,
                posted = summary.posted(),
                failed = summary.failures.len(),
                "Daily settlement sync complete"
            ),
            Err(e) => log_run_error("daily_sync", &e),
        }
    }
}

async fn run_hourly(settlement: Arc<SettlementService>, transfers: ClearingTransferService, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match settlement.run_late_allocation_sweep(Utc::now()).await {
            Ok(summary) => tracing::info!(
                revisited = summary.listed,
                failed = summary.failures.len(),
                "Late allocation sweep complete"
            ),
            Err(e) => log_run_error("late_allocation_sweep", &e),
        }

        match transfers.run(Utc::now()).await {
            Ok(summary) => tracing::info!(
                created = summary.created.len(),
                not_due = summary.not_due,
                failed = summary.failed,
                "Clearing transfers complete"
            ),
            Err(e) => tracing::error!(
                category = %e.category(),
                error = %e,
                "Clearing transfer run failed"
            ),
        }
    }
}

fn log_run_error(run: &str, e: &SettlementError) {
    if matches!(e, SettlementError::Config(ConfigError::SyncDisabled)) {
        tracing::warn!(run = %run, "Skipped, settlement sync is disabled");
        return;
    }
    tracing::error!(run = %run, category = %e.category(), error = %e, "Scheduled run failed");
}
