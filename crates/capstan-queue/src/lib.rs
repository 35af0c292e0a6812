//! capstan-queue — durable, scope-coalesced work queue.
//!
//! Work items are keyed by `(workspace, kind, scope_type, scope_id)`;
//! enqueueing an already-pending scope coalesces into the existing row
//! instead of creating a duplicate, so consumers always see the latest
//! event applied to current persistent state. Claims take time-bounded
//! leases; acks are guarded by an update token so a worker that lost
//! its lease cannot clobber the re-claiming owner's outcome.
//!
//! Delivery is at-least-once; consumers must be idempotent.

pub mod error;
pub mod item;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use item::{ItemStatus, WorkItem};
pub use queue::{AckOutcome, EnqueueRequest, WorkQueue};

/// Work item kinds understood by the reconcile engine.
pub mod kinds {
    /// Recompute the matching resource set of a deployment.
    pub const DEPLOYMENT_SELECTOR_EVAL: &str = "deployment-resource-selector-eval";
    /// Recompute every deployment in an environment's system.
    pub const ENVIRONMENT_SELECTOR_EVAL: &str = "environment-resource-selector-eval";
    /// Incremental recompute for a single upserted resource.
    pub const RESOURCE_SELECTOR_EVAL: &str = "resource-selector-eval";
    /// Resolve the desired release for one release target.
    pub const DESIRED_RELEASE: &str = "desired-release";
    /// A release target stopped existing; drop its current release.
    pub const RELEASE_TARGET_REMOVAL: &str = "release-target-removal";
    /// Take the next measurement for a verification metric.
    pub const VERIFICATION_METRIC: &str = "verification-metric";
}
