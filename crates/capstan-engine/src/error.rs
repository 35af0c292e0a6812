//! Error types for the reconcile engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while reconciling work items.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The work item references an entity that no longer exists.
    #[error("{0} {1} not found")]
    NotFound(&'static str, String),

    /// The work item kind has no registered processor.
    #[error("no processor for work item kind {0}")]
    UnknownKind(String),

    /// The scope id is not a canonical release-target key.
    #[error("malformed release target key: {0}")]
    MalformedTarget(String),

    #[error(transparent)]
    Store(#[from] capstan_store::StoreError),

    #[error(transparent)]
    Queue(#[from] capstan_queue::QueueError),

    #[error(transparent)]
    Policy(#[from] capstan_policy::PolicyError),

    #[error(transparent)]
    Vars(#[from] capstan_vars::VarsError),

    #[error(transparent)]
    Verify(#[from] capstan_verify::VerifyError),
}
