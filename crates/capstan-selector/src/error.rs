//! Error types for selector compilation and evaluation.

use thiserror::Error;

/// Result type alias for selector operations.
pub type SelectorResult<T> = Result<T, SelectorError>;

/// Errors that can occur while compiling or evaluating a selector.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("lex error at offset {offset}: {message}")]
    Lex { offset: usize, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid legacy selector: {0}")]
    InvalidJsonForm(String),

    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("unknown method {0:?}")]
    UnknownMethod(String),
}
