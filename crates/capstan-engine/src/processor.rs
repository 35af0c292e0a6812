//! Work item dispatch.
//!
//! Maps a claimed work item to its controller by kind. Controllers are
//! constructed per item; their policy memo tables live exactly as long
//! as one item's processing.

use capstan_queue::{WorkItem, WorkQueue, kinds};
use capstan_store::Store;
use capstan_verify::{ReconcileOutcome, VerificationScheduler};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::desired_release::DesiredReleaseController;
use crate::error::{EngineError, EngineResult};
use crate::selector_eval::SelectorEvalController;

/// What to do with a work item after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The item is finished.
    Done,
    /// Re-enqueue the same scope, claimable no earlier than the instant.
    RequeueAt(DateTime<Utc>),
}

/// Routes work items to the engine's controllers.
pub struct Dispatcher {
    store: Store,
    queue: WorkQueue,
}

impl Dispatcher {
    pub fn new(store: Store, queue: WorkQueue) -> Self {
        Self { store, queue }
    }

    /// All work item kinds this dispatcher understands.
    pub fn kinds() -> &'static [&'static str] {
        &[
            kinds::DEPLOYMENT_SELECTOR_EVAL,
            kinds::ENVIRONMENT_SELECTOR_EVAL,
            kinds::RESOURCE_SELECTOR_EVAL,
            kinds::DESIRED_RELEASE,
            kinds::RELEASE_TARGET_REMOVAL,
            kinds::VERIFICATION_METRIC,
        ]
    }

    pub async fn process(&self, item: &WorkItem) -> EngineResult<Outcome> {
        let now = Utc::now();
        debug!(kind = %item.kind, scope = %item.scope_id, "processing work item");
        match item.kind.as_str() {
            kinds::DEPLOYMENT_SELECTOR_EVAL => {
                SelectorEvalController::new(&self.store, &self.queue)
                    .recompute_deployment(&item.workspace_id, &item.scope_id)?;
                Ok(Outcome::Done)
            }
            kinds::ENVIRONMENT_SELECTOR_EVAL => {
                SelectorEvalController::new(&self.store, &self.queue)
                    .recompute_environment(&item.workspace_id, &item.scope_id)?;
                Ok(Outcome::Done)
            }
            kinds::RESOURCE_SELECTOR_EVAL => {
                SelectorEvalController::new(&self.store, &self.queue)
                    .recompute_for_resource(&item.workspace_id, &item.scope_id)?;
                Ok(Outcome::Done)
            }
            kinds::DESIRED_RELEASE => DesiredReleaseController::new(&self.store, &self.queue)
                .reconcile(&item.workspace_id, &item.scope_id, now),
            kinds::RELEASE_TARGET_REMOVAL => {
                DesiredReleaseController::new(&self.store, &self.queue)
                    .remove_target(&item.scope_id)
            }
            kinds::VERIFICATION_METRIC => {
                let outcome = VerificationScheduler::new(&self.store)
                    .reconcile(&item.scope_id, now)
                    .await?;
                Ok(match outcome {
                    ReconcileOutcome::Completed(_) => Outcome::Done,
                    ReconcileOutcome::RequeueAt(at) => Outcome::RequeueAt(at),
                })
            }
            other => Err(EngineError::UnknownKind(other.to_string())),
        }
    }
}
