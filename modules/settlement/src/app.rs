//! Service wiring shared by the scheduler and the admin runner

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{Config, SettlementSettings};
use crate::db;
use crate::ingest::FetchSettings;
use crate::jobs::{FinalizeJob, InMemoryJobQueue};
use crate::ledger::{InMemoryLedger, LedgerPort, PgLedger};
use crate::marketplace::{MarketplaceClient, MarketplaceError, RefreshTokenProvider};
use crate::services::fx_service::ManualRateBook;
use crate::services::{ClearingTransferService, FinalizeService, FxService, HttpRateProvider, SettlementService};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Invalid LEDGER_BACKEND: {0}. Must be 'inmemory' or 'postgres'")]
    InvalidBackend(String),

    #[error("DATABASE_URL must be set for the postgres backend")]
    MissingDatabaseUrl,

    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migrations failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Marketplace client setup failed: {0}")]
    Marketplace(#[from] MarketplaceError),
}

/// Fully wired services; `finalize_jobs` feeds the finalize worker
pub struct App {
    pub settings: Arc<SettlementSettings>,
    pub ledger: Arc<dyn LedgerPort>,
    pub settlement: Arc<SettlementService>,
    pub finalize: Arc<FinalizeService>,
    pub transfers: ClearingTransferService,
    pub finalize_jobs: UnboundedReceiver<FinalizeJob>,
}

impl App {
    pub async fn build(config: Config) -> Result<Self, StartupError> {
        let (ledger, manual_rates): (Arc<dyn LedgerPort>, Arc<dyn ManualRateBook>) =
            match config.ledger_backend.as_str() {
                "inmemory" => {
                    tracing::info!("Using in-memory ledger");
                    let ledger = Arc::new(InMemoryLedger::new());
                    (ledger.clone(), ledger)
                }
                "postgres" => {
                    let url = config.database_url.as_deref().ok_or(StartupError::MissingDatabaseUrl)?;
                    tracing::info!("Connecting to database...");
                    let pool = db::init_pool(url).await?;
                    tracing::info!("Running migrations...");
                    db::run_migrations(&pool).await?;
                    let ledger = Arc::new(PgLedger::new(pool));
                    (ledger.clone(), ledger)
                }
                other => return Err(StartupError::InvalidBackend(other.to_string())),
            };

        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MarketplaceError::HttpError(e.to_string()))?;
        let tokens = Arc::new(RefreshTokenProvider::new(&config.marketplace, http_client));
        let source = Arc::new(MarketplaceClient::new(config.marketplace.clone(), tokens)?);

        let fx = Arc::new(FxService::new(
            Arc::new(HttpRateProvider::new(config.fx_provider_url.clone())),
            manual_rates,
        ));

        let settings = Arc::new(config.settlement);
        let (queue, finalize_jobs) = InMemoryJobQueue::new();
        let settlement = Arc::new(SettlementService::new(
            settings.clone(),
            source,
            FetchSettings::default(),
            ledger.clone(),
            fx,
            Arc::new(queue),
        ));
        let finalize = Arc::new(FinalizeService::new(ledger.clone(), settings.clone()));
        let transfers = ClearingTransferService::new(ledger.clone(), settings.clone());

        Ok(Self {
            settings,
            ledger,
            settlement,
            finalize,
            transfers,
            finalize_jobs,
        })
    }
}
