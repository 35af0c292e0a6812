//! capstan-verify — verification metrics and their scheduler.
//!
//! A verification attaches metrics to a dispatched job. Each metric
//! samples a provider (Prometheus, or a sleep stub in tests) on an
//! interval, classifies every sample against CEL conditions over the
//! result document, and terminates passed or failed within its
//! measurement budget.

pub mod error;
pub mod provider;
pub mod scheduler;

pub use error::{VerifyError, VerifyResult};
pub use provider::{PrometheusConfig, Provider, template};
pub use scheduler::{ReconcileOutcome, VerificationScheduler, classify, terminal_status};
