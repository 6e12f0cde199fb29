use thiserror::Error;

use crate::error::ErrorCategory;

#[derive(Error, Debug)]
pub enum MarketplaceError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
}

impl MarketplaceError {
    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(self, MarketplaceError::ApiError { status_code, .. } if (400..500).contains(status_code))
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        matches!(self, MarketplaceError::ApiError { status_code, .. } if (500..600).contains(status_code))
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            MarketplaceError::ConfigError(_) | MarketplaceError::AuthError(_) => ErrorCategory::Fatal,
            MarketplaceError::HttpError(_) | MarketplaceError::RateLimited { .. } => ErrorCategory::Transient,
            MarketplaceError::ApiError { .. } if self.is_server_error() => ErrorCategory::Transient,
            MarketplaceError::ApiError { .. } => ErrorCategory::BusinessRule,
            MarketplaceError::ParseError(_) => ErrorCategory::DataQuality,
        }
    }
}

/// Result type for marketplace calls
pub type MarketplaceResult<T> = Result<T, MarketplaceError>;
