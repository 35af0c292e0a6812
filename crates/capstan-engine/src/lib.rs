//! capstan-engine — the reconcile loop tying the control plane together.
//!
//! # Architecture
//!
//! ```text
//! entity mutation
//!   └── selector-eval item (C: SelectorEvalController)
//!         ├── diff vs computed targets
//!         ├── desired-release item per added target
//!         └── removal item per dropped target
//! desired-release item (C: DesiredReleaseController)
//!   ├── policy gates per candidate version
//!   ├── variable resolution
//!   └── release + job dispatch, verification launch
//! verification-metric item → capstan-verify scheduler
//! ```
//!
//! `ReconcileWorker` drives the whole thing: claim a batch from the
//! queue, dispatch by kind, heartbeat leases, ack with backoff.

pub mod desired_release;
pub mod error;
pub mod processor;
pub mod selector_eval;
pub mod worker;

pub use desired_release::DesiredReleaseController;
pub use error::{EngineError, EngineResult};
pub use processor::{Dispatcher, Outcome};
pub use selector_eval::SelectorEvalController;
pub use worker::{ReconcileWorker, WorkerConfig};
