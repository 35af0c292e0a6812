//! Selector-eval controller.
//!
//! Materializes release targets from selectors. For each `(deployment,
//! environment)` pair in a system, the target set is the workspace
//! resources matched by the environment selector and, when present,
//! narrowed by the deployment selector. An environment without a
//! selector owns no resources; a deployment without one takes every
//! resource its environments matched.
//!
//! Recomputation diffs against the previously persisted set: added
//! targets enqueue a desired-release item, removed targets enqueue a
//! removal item. The new set is persisted only after both enqueues, so
//! a crash mid-diff re-detects the same delta on the next run.

use capstan_core::entities::{Deployment, Environment, ReleaseTarget, Resource};
use capstan_queue::{EnqueueRequest, WorkQueue, kinds};
use capstan_selector::Program;
use capstan_store::Store;
use tracing::{debug, info, warn};

use crate::error::EngineResult;

/// Resources are matched in bounded slices so a large workspace scan
/// stays interruptible between batches.
const SCAN_BATCH: usize = 500;

pub struct SelectorEvalController<'a> {
    store: &'a Store,
    queue: &'a WorkQueue,
}

impl<'a> SelectorEvalController<'a> {
    pub fn new(store: &'a Store, queue: &'a WorkQueue) -> Self {
        Self { store, queue }
    }

    /// Recompute every `(deployment, environment)` pair for a changed
    /// deployment.
    pub fn recompute_deployment(
        &self,
        workspace_id: &str,
        deployment_id: &str,
    ) -> EngineResult<()> {
        let Some(deployment) = self.store.get_deployment(workspace_id, deployment_id)? else {
            debug!(deployment = %deployment_id, "deployment gone; nothing to recompute");
            return Ok(());
        };
        let environments = self
            .store
            .list_environments_for_system(workspace_id, &deployment.system_id)?;
        let resources = self.store.list_resources(workspace_id)?;
        for environment in &environments {
            self.recompute_pair(&deployment, environment, &resources)?;
        }
        Ok(())
    }

    /// Recompute every deployment in a changed environment's system.
    pub fn recompute_environment(
        &self,
        workspace_id: &str,
        environment_id: &str,
    ) -> EngineResult<()> {
        let Some(environment) = self.store.get_environment(workspace_id, environment_id)? else {
            debug!(environment = %environment_id, "environment gone; nothing to recompute");
            return Ok(());
        };
        let deployments = self
            .store
            .list_deployments_for_system(workspace_id, &environment.system_id)?;
        let resources = self.store.list_resources(workspace_id)?;
        for deployment in &deployments {
            self.recompute_pair(deployment, &environment, &resources)?;
        }
        Ok(())
    }

    /// Incremental recompute after a resource upsert or delete: only
    /// pairs whose membership for this resource changed are touched.
    pub fn recompute_for_resource(
        &self,
        workspace_id: &str,
        resource_id: &str,
    ) -> EngineResult<()> {
        let resource = self.store.get_resource(workspace_id, resource_id)?;
        let doc = resource.as_ref().map(Resource::selector_doc);

        for deployment in self.store.list_deployments(workspace_id)? {
            let environments = self
                .store
                .list_environments_for_system(workspace_id, &deployment.system_id)?;
            for environment in &environments {
                let previous = self
                    .store
                    .get_computed_targets(&deployment.id, &environment.id)?;
                let was_member = previous.iter().any(|id| id == resource_id);
                let is_member = match &doc {
                    None => false,
                    Some(doc) => pair_matches(&deployment, environment, doc),
                };
                if was_member == is_member {
                    continue;
                }

                let target = ReleaseTarget {
                    resource_id: resource_id.to_string(),
                    environment_id: environment.id.clone(),
                    deployment_id: deployment.id.clone(),
                };
                let mut next = previous;
                if is_member {
                    next.push(resource_id.to_string());
                    self.enqueue_target(workspace_id, kinds::DESIRED_RELEASE, &target)?;
                } else {
                    next.retain(|id| id != resource_id);
                    self.enqueue_target(workspace_id, kinds::RELEASE_TARGET_REMOVAL, &target)?;
                }
                self.store
                    .put_computed_targets(&deployment.id, &environment.id, &next)?;
            }
        }
        Ok(())
    }

    fn recompute_pair(
        &self,
        deployment: &Deployment,
        environment: &Environment,
        resources: &[Resource],
    ) -> EngineResult<()> {
        let matched = match_resources(deployment, environment, resources);
        let previous = self
            .store
            .get_computed_targets(&deployment.id, &environment.id)?;

        let mut added = 0;
        for resource_id in &matched {
            if previous.contains(resource_id) {
                continue;
            }
            let target = ReleaseTarget {
                resource_id: resource_id.clone(),
                environment_id: environment.id.clone(),
                deployment_id: deployment.id.clone(),
            };
            self.enqueue_target(&deployment.workspace_id, kinds::DESIRED_RELEASE, &target)?;
            added += 1;
        }

        let mut removed = 0;
        for resource_id in &previous {
            if matched.contains(resource_id) {
                continue;
            }
            let target = ReleaseTarget {
                resource_id: resource_id.clone(),
                environment_id: environment.id.clone(),
                deployment_id: deployment.id.clone(),
            };
            self.enqueue_target(
                &deployment.workspace_id,
                kinds::RELEASE_TARGET_REMOVAL,
                &target,
            )?;
            removed += 1;
        }

        self.store
            .put_computed_targets(&deployment.id, &environment.id, &matched)?;
        if added > 0 || removed > 0 {
            info!(
                deployment = %deployment.id,
                environment = %environment.id,
                total = matched.len(),
                added,
                removed,
                "release targets recomputed"
            );
        }
        Ok(())
    }

    fn enqueue_target(
        &self,
        workspace_id: &str,
        kind: &str,
        target: &ReleaseTarget,
    ) -> EngineResult<()> {
        self.queue.enqueue(EnqueueRequest::new(
            workspace_id,
            kind,
            "release-target",
            &target.key(),
        ))?;
        Ok(())
    }
}

/// Resource ids matched by both selectors of a pair, in input order.
fn match_resources(
    deployment: &Deployment,
    environment: &Environment,
    resources: &[Resource],
) -> Vec<String> {
    let Some(env_program) = compile(environment.resource_selector.as_ref(), &environment.id) else {
        return Vec::new();
    };
    let dep_program = match &deployment.resource_selector {
        None => None,
        Some(selector) => match compile(Some(selector), &deployment.id) {
            Some(program) => Some(program),
            // Uncompilable deployment selector matches nothing.
            None => return Vec::new(),
        },
    };

    let mut matched = Vec::new();
    for batch in resources.chunks(SCAN_BATCH) {
        for resource in batch {
            if resource.workspace_id != environment.workspace_id {
                continue;
            }
            let doc = resource.selector_doc();
            if env_program.matches(&doc) && dep_program.as_ref().is_none_or(|p| p.matches(&doc)) {
                matched.push(resource.id.clone());
            }
        }
    }
    matched
}

fn pair_matches(
    deployment: &Deployment,
    environment: &Environment,
    doc: &serde_json::Value,
) -> bool {
    let Some(env_program) = compile(environment.resource_selector.as_ref(), &environment.id) else {
        return false;
    };
    if !env_program.matches(doc) {
        return false;
    }
    match &deployment.resource_selector {
        None => true,
        Some(selector) => compile(Some(selector), &deployment.id)
            .is_some_and(|program| program.matches(doc)),
    }
}

fn compile(selector: Option<&capstan_selector::Selector>, owner: &str) -> Option<Program> {
    match selector?.compile() {
        Ok(program) => Some(program),
        Err(e) => {
            warn!(owner = %owner, error = %e, "selector failed to compile; treating as no match");
            None
        }
    }
}
