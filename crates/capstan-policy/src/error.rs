//! Error types for policy evaluation.

use thiserror::Error;

/// Result type alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors that can occur while evaluating policies.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid rule configuration: {0}")]
    InvalidRule(String),

    #[error(transparent)]
    Selector(#[from] capstan_selector::SelectorError),

    #[error(transparent)]
    Store(#[from] capstan_store::StoreError),
}
