//! capstan-policy — policy rule evaluation.
//!
//! Given an evaluation scope (workspace, environment, deployment,
//! resource, candidate version), decides whether a version may be
//! released to a target. Denials carry human-readable messages,
//! structured details, and, where the rule can tell, the wall-clock
//! moment the denial lifts so the scheduler can requeue precisely.

pub mod error;
pub mod evaluator;
pub mod rollout;
pub mod scope;
pub mod window;

pub use error::{PolicyError, PolicyResult};
pub use evaluator::{
    Decision, Denial, PolicyEngine, Verdict, retry_limit, rollback_enabled, verification_metrics,
};
pub use scope::{EvalScope, ScopeField};
pub use window::{Window, WindowState};
