//! Error types for the worker registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No worker owns the partition.
    #[error("no worker assigned to partition {0}")]
    NoWorker(i32),

    /// The worker is unknown or its heartbeat went stale.
    #[error("worker {0} not found")]
    WorkerNotFound(String),
}
