//! Error types for the enrichment engine.

use thiserror::Error;

/// Errors raised by collaborators and by the batch driver.
#[derive(Debug, Error)]
pub enum EnrichError {
    /// An HTTP request to an external source failed.
    #[error("HTTP error from {source_name}: {message}")]
    Http {
        source_name: String,
        message: String,
    },

    /// The external source returned a rate-limit response.
    #[error("rate limited by {source_name}")]
    RateLimited { source_name: String },

    /// The requested entity was not found at the external source.
    #[error("not found: {entity} at {source_name}")]
    NotFound { entity: String, source_name: String },

    /// A call was still pending when the row deadline passed.
    #[error("{source_name} did not answer before the row deadline")]
    TimedOut { source_name: String },

    /// A response from an external source could not be parsed.
    #[error("parse error from {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    /// An error propagated from `reqwest`.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// An error propagated from the core domain layer.
    #[error("core error: {0}")]
    Core(#[from] prospect_core::Error),

    /// Flushed output could not be made durable. Fatal to a run.
    #[error("durability fault: {message}")]
    Durability { message: String },

    /// The run was stopped by the operator before it finished.
    #[error("run cancelled")]
    Cancelled,

    /// The input table or run options are unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EnrichError {
    pub fn http(source_name: &str, message: impl ToString) -> Self {
        Self::Http {
            source_name: source_name.to_string(),
            message: message.to_string(),
        }
    }

    pub fn parse(source_name: &str, message: impl ToString) -> Self {
        Self::Parse {
            source_name: source_name.to_string(),
            message: message.to_string(),
        }
    }

    pub fn durability(message: impl ToString) -> Self {
        Self::Durability {
            message: message.to_string(),
        }
    }

    /// Returns `true` when the error is transient and the operation may
    /// succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { .. } | Self::RateLimited { .. } => true,
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Returns `true` when the upstream rejected the call for exceeding its rate.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Returns `true` when the error indicates the entity was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias for enrichment results.
pub type EnrichResult<T> = std::result::Result<T, EnrichError>;
