//! Error types for variable resolution.

use thiserror::Error;

/// Result type alias for resolver operations.
pub type VarsResult<T> = Result<T, VarsError>;

/// Errors that can occur while resolving variables.
#[derive(Debug, Error)]
pub enum VarsError {
    /// Sensitive values are opaque to this layer; only downstream
    /// holders of the decryption key may resolve them.
    #[error("sensitive value is not resolvable here (hash {value_hash})")]
    SensitiveNotResolvable { value_hash: String },

    #[error("value did not resolve: {0}")]
    Unresolvable(String),

    #[error(transparent)]
    Store(#[from] capstan_store::StoreError),
}
