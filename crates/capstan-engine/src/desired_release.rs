//! Desired-release controller.
//!
//! For one release target: walk candidate versions newest-first, gate
//! each through the policy engine, resolve variables for the first
//! fully allowed candidate, and persist the release. A job referencing
//! the release is dispatched only when the release id actually changed,
//! so replays and stale-lease re-runs are no-ops.
//!
//! A candidate denied without a retry time is skipped; one denied only
//! with future retry times keeps the earliest such time, and when no
//! candidate is chosen the item requeues at that edge.

use capstan_core::entities::{Release, ReleaseTarget};
use capstan_core::hash::release_id;
use capstan_core::job::{Job, JobStatus, JobVerification, VerificationMetric, VerificationStatus};
use capstan_core::policy::VerificationTrigger;
use capstan_policy::{EvalScope, PolicyEngine, verification_metrics};
use capstan_queue::{EnqueueRequest, WorkQueue, kinds};
use capstan_store::Store;
use capstan_vars::{StoreRelations, VariableResolver};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::processor::Outcome;

/// Newest versions considered per reconcile pass.
const CANDIDATE_LIMIT: usize = 20;

pub struct DesiredReleaseController<'a> {
    store: &'a Store,
    queue: &'a WorkQueue,
}

impl<'a> DesiredReleaseController<'a> {
    pub fn new(store: &'a Store, queue: &'a WorkQueue) -> Self {
        Self { store, queue }
    }

    /// Reconcile one release target to its desired release.
    pub fn reconcile(
        &self,
        workspace_id: &str,
        target_key: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Outcome> {
        let target = ReleaseTarget::parse(target_key)
            .ok_or_else(|| EngineError::MalformedTarget(target_key.to_string()))?;

        // The target may have stopped existing since this item was
        // enqueued; converge by dropping the current release.
        let loaded = self.load_scope_entities(workspace_id, &target)?;
        let Some((resource, environment, deployment)) = loaded else {
            if self.store.delete_release(&target)? {
                info!(target = %target_key, "target gone; release removed");
            }
            return Ok(Outcome::Done);
        };

        let candidates = self.store.list_versions(&deployment.id, CANDIDATE_LIMIT)?;
        let Some(first) = candidates.first() else {
            debug!(target = %target_key, "no versions; nothing to release");
            return Ok(Outcome::Done);
        };

        let engine = PolicyEngine::new(self.store);
        // Policy selectors never read the version, so the applicable
        // set is computed once against the first candidate's scope.
        let policies = engine.applicable_policies(&EvalScope {
            workspace_id,
            environment: &environment,
            deployment: &deployment,
            resource: &resource,
            version: first,
        })?;

        let mut chosen = None;
        let mut earliest_retry: Option<DateTime<Utc>> = None;
        let mut denied_reasons = Vec::new();
        for candidate in &candidates {
            let scope = EvalScope {
                workspace_id,
                environment: &environment,
                deployment: &deployment,
                resource: &resource,
                version: candidate,
            };
            let verdict = engine.evaluate(&policies, &scope, now)?;
            if verdict.allowed() {
                chosen = Some(candidate);
                break;
            }
            match verdict.retry_at() {
                Some(retry_at) if retry_at > now => {
                    debug!(target = %target_key, version = %candidate.tag, %retry_at, "candidate deferred");
                    earliest_retry = Some(match earliest_retry {
                        Some(current) => current.min(retry_at),
                        None => retry_at,
                    });
                }
                _ => denied_reasons.extend(verdict.denied_reasons()),
            }
        }

        let Some(version) = chosen else {
            return Ok(match earliest_retry {
                Some(retry_at) => Outcome::RequeueAt(retry_at),
                None => Outcome::Done,
            });
        };

        let resolver = VariableResolver::new(self.store, StoreRelations::new(self.store));
        let variables = resolver.resolve(&deployment, &resource)?;
        let id = release_id(&target, &version.id, &variables);

        let current = self.store.get_release(&target)?;
        if current.as_ref().is_some_and(|release| release.id == id) {
            debug!(target = %target_key, release = %id, "already desired; no dispatch");
            return Ok(Outcome::Done);
        }

        let release = Release {
            id: id.clone(),
            target,
            version_id: version.id.clone(),
            variables,
            denied_reasons,
            created_at: now,
        };
        self.store.put_release(&release)?;

        let job = Job {
            id: format!("job-{}", id.trim_start_matches("rel-")),
            release_id: id.clone(),
            job_agent_id: deployment.job_agent_id.clone(),
            job_agent_config: if version.job_agent_config.is_null() {
                deployment.job_agent_config.clone()
            } else {
                version.job_agent_config.clone()
            },
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.store.put_job(&job)?;
        info!(target = %target_key, release = %id, job = %job.id, version = %version.tag, "release dispatched");

        self.launch_verifications(workspace_id, &job, &policies, now)?;
        Ok(Outcome::Done)
    }

    /// Handle a removal item: the target's current release is dropped.
    pub fn remove_target(&self, target_key: &str) -> EngineResult<Outcome> {
        let target = ReleaseTarget::parse(target_key)
            .ok_or_else(|| EngineError::MalformedTarget(target_key.to_string()))?;
        if self.store.delete_release(&target)? {
            info!(target = %target_key, "release target removed");
        }
        Ok(Outcome::Done)
    }

    fn load_scope_entities(
        &self,
        workspace_id: &str,
        target: &ReleaseTarget,
    ) -> EngineResult<
        Option<(
            capstan_core::entities::Resource,
            capstan_core::entities::Environment,
            capstan_core::entities::Deployment,
        )>,
    > {
        let Some(resource) = self.store.get_resource(workspace_id, &target.resource_id)? else {
            return Ok(None);
        };
        let Some(environment) = self
            .store
            .get_environment(workspace_id, &target.environment_id)?
        else {
            return Ok(None);
        };
        let Some(deployment) = self
            .store
            .get_deployment(workspace_id, &target.deployment_id)?
        else {
            return Ok(None);
        };
        let members = self
            .store
            .get_computed_targets(&deployment.id, &environment.id)?;
        if !members.iter().any(|id| *id == target.resource_id) {
            return Ok(None);
        }
        Ok(Some((resource, environment, deployment)))
    }

    /// Create verification records for every metric declared by a
    /// `verification_action` rule firing on job creation, and enqueue
    /// their first measurement.
    fn launch_verifications(
        &self,
        workspace_id: &str,
        job: &Job,
        policies: &[capstan_core::policy::Policy],
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let templates = verification_metrics(policies, VerificationTrigger::JobCreated);
        if templates.is_empty() {
            return Ok(());
        }

        let verification = JobVerification {
            id: format!("ver-{}", job.id.trim_start_matches("job-")),
            job_id: job.id.clone(),
            status: VerificationStatus::Running,
            created_at: now,
        };
        self.store.put_verification(&verification)?;

        for (index, template) in templates.iter().enumerate() {
            let metric = VerificationMetric {
                id: format!("{}-m{}", verification.id, index + 1),
                job_verification_id: verification.id.clone(),
                name: template.name.clone(),
                provider: template.provider.clone(),
                interval_seconds: template.interval_seconds,
                count: template.count,
                success_condition: template.success_condition.clone(),
                success_threshold: template.success_threshold,
                failure_condition: template.failure_condition.clone(),
                failure_threshold: template.failure_threshold,
            };
            self.store.put_metric(&metric)?;
            self.queue.enqueue(EnqueueRequest::new(
                workspace_id,
                kinds::VERIFICATION_METRIC,
                "verification-metric",
                &metric.id,
            ))?;
        }
        info!(job = %job.id, metrics = templates.len(), "verification launched");
        Ok(())
    }
}
