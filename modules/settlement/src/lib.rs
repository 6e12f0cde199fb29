pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod ledger;
pub mod marketplace;
pub mod models;
pub mod retry;
pub mod services;
pub mod validation;

pub use error::{ErrorCategory, SettlementError, SettlementResult};
pub use jobs::start_finalize_worker;
