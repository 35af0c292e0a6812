//! Error types for verification scheduling.

use thiserror::Error;

/// Result type alias for verification operations.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Errors that can occur while scheduling verifications.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("metric {0} not found")]
    MetricNotFound(String),

    #[error("invalid provider config: {0}")]
    InvalidProvider(String),

    #[error(transparent)]
    Store(#[from] capstan_store::StoreError),
}
