//! Error taxonomy for the settlement engine
//!
//! Every component owns its own `thiserror` enum. Each of them maps onto an
//! [`ErrorCategory`] so the orchestrator can decide whether a failure is
//! retried, skipped, surfaced to an operator, or disables the sync entirely.

use std::fmt;

use crate::config::ConfigError;
use crate::ingest::fetcher::FetchError;
use crate::jobs::JobError;
use crate::ledger::LedgerError;
use crate::marketplace::MarketplaceError;
use crate::services::allocation_service::AllocationError;
use crate::services::finalize_service::FinalizeError;
use crate::services::fx_service::FxError;
use crate::services::posting_builder::PostingError;
use crate::validation::ValidationError;

/// How a failure is handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network, 429/5xx, lock contention, FX outage: retried, then degraded
    Transient,
    /// Missing headers, unparseable values: defaulted or skipped
    DataQuality,
    /// Imbalance, missing FX with no fallback: operator-facing, unit skipped
    BusinessRule,
    /// Missing account mappings, disabled integration: sync disabled
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::DataQuality => "data_quality",
            ErrorCategory::BusinessRule => "business_rule",
            ErrorCategory::Fatal => "fatal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCategory::Fatal)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error for one unit of settlement work
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Marketplace error: {0}")]
    Marketplace(#[from] MarketplaceError),

    #[error("Report fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("FX error: {0}")]
    Fx(#[from] FxError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Posting build failed: {0}")]
    Posting(#[from] PostingError),

    #[error("Posting validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Finalize failed: {0}")]
    Finalize(#[from] FinalizeError),

    #[error("Job queue error: {0}")]
    Job(#[from] JobError),
}

impl SettlementError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SettlementError::Config(_) => ErrorCategory::Fatal,
            SettlementError::Marketplace(e) => e.category(),
            SettlementError::Fetch(e) => e.category(),
            SettlementError::Fx(e) => e.category(),
            SettlementError::Ledger(e) => e.category(),
            SettlementError::Posting(e) => e.category(),
            SettlementError::Validation(_) => ErrorCategory::BusinessRule,
            SettlementError::Allocation(e) => e.category(),
            SettlementError::Finalize(e) => e.category(),
            SettlementError::Job(_) => ErrorCategory::Transient,
        }
    }
}

/// Result type for orchestrator operations
pub type SettlementResult<T> = Result<T, SettlementError>;
