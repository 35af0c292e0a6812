//! Rule evaluation engine.
//!
//! Dispatches on the `RuleKind` tag, memoizes decisions per work item
//! by `(ruleId, declared scope subset)`, and composes policies: a
//! target passes iff every enabled gate rule allows it. Action-trigger
//! rules (retry, rollback, verification-action) are not gates; the
//! dispatch stage reads them through the helpers at the bottom.

use std::cell::RefCell;
use std::collections::HashMap;

use capstan_core::entities::{DeniedReason, Release, VersionStatus};
use capstan_core::job::{Job, JobStatus};
use capstan_core::policy::{
    MetricTemplate, Policy, PolicyRule, RuleKind, VerificationTrigger,
};
use capstan_store::Store;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::error::PolicyResult;
use crate::rollout;
use crate::scope::{EvalScope, ScopeField, memo_key};
use crate::window::{Window, WindowState};

// ── Decisions ──────────────────────────────────────────────────────

/// Outcome of a single rule evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub message: String,
    pub details: serde_json::Value,
    /// When the denial will lift on its own, if the rule can tell.
    pub retry_at: Option<DateTime<Utc>>,
}

impl Decision {
    fn allow(message: impl Into<String>) -> Self {
        Self {
            allowed: true,
            message: message.into(),
            details: serde_json::Value::Null,
            retry_at: None,
        }
    }

    fn deny(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            allowed: false,
            message: message.into(),
            details,
            retry_at: None,
        }
    }

    fn deny_until(
        message: impl Into<String>,
        details: serde_json::Value,
        retry_at: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed: false,
            message: message.into(),
            details,
            retry_at: Some(retry_at),
        }
    }
}

/// A rule that denied, with its decision.
#[derive(Debug, Clone)]
pub struct Denial {
    pub rule_id: String,
    pub decision: Decision,
}

/// Composed outcome across every gate rule of the applicable policies.
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    pub denials: Vec<Denial>,
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        self.denials.is_empty()
    }

    /// Earliest self-lifting time, present only when *every* denial
    /// carries one. A denial without a retry time means this candidate
    /// is simply not eligible and the controller moves on.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        if self.denials.is_empty() || self.denials.iter().any(|d| d.decision.retry_at.is_none()) {
            return None;
        }
        self.denials.iter().filter_map(|d| d.decision.retry_at).min()
    }

    /// Denials rendered for a release's observability surface.
    pub fn denied_reasons(&self) -> Vec<DeniedReason> {
        self.denials
            .iter()
            .map(|d| DeniedReason {
                rule_id: d.rule_id.clone(),
                message: d.decision.message.clone(),
                details: d.decision.details.clone(),
            })
            .collect()
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Evaluates policy rules against a scope. One engine instance lives
/// for the duration of a single work item; the memo table dies with it.
pub struct PolicyEngine<'a> {
    store: &'a Store,
    memo: RefCell<HashMap<String, Decision>>,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            memo: RefCell::new(HashMap::new()),
        }
    }

    /// Enabled policies whose selector matches the scope, ordered by
    /// priority descending (message ordering only).
    pub fn applicable_policies(&self, scope: &EvalScope<'_>) -> PolicyResult<Vec<Policy>> {
        let doc = scope.doc();
        let mut applicable: Vec<Policy> = self
            .store
            .list_policies(scope.workspace_id)?
            .into_iter()
            .filter(|p| p.enabled)
            .filter(|p| match &p.selector {
                Some(selector) => selector.matches(&doc).unwrap_or(false),
                None => true,
            })
            .collect();
        applicable.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(applicable)
    }

    /// Run every gate rule of every policy against the scope.
    pub fn evaluate(
        &self,
        policies: &[Policy],
        scope: &EvalScope<'_>,
        now: DateTime<Utc>,
    ) -> PolicyResult<Verdict> {
        let mut verdict = Verdict::default();
        for policy in policies {
            for rule in &policy.rules {
                if is_action_trigger(&rule.kind) {
                    continue;
                }
                let decision = self.evaluate_rule(rule, scope, now)?;
                if !decision.allowed {
                    debug!(
                        rule = %rule.id,
                        message = %decision.message,
                        retry_at = ?decision.retry_at,
                        "rule denied"
                    );
                    verdict.denials.push(Denial {
                        rule_id: rule.id.clone(),
                        decision,
                    });
                }
            }
        }
        Ok(verdict)
    }

    /// Evaluate one rule, consulting the per-item memo first.
    pub fn evaluate_rule(
        &self,
        rule: &PolicyRule,
        scope: &EvalScope<'_>,
        now: DateTime<Utc>,
    ) -> PolicyResult<Decision> {
        let key = memo_key(&rule.id, declared_fields(&rule.kind), scope);
        if let Some(hit) = self.memo.borrow().get(&key) {
            return Ok(hit.clone());
        }
        let decision = self.compute(rule, scope, now)?;
        self.memo.borrow_mut().insert(key, decision.clone());
        Ok(decision)
    }

    fn compute(
        &self,
        rule: &PolicyRule,
        scope: &EvalScope<'_>,
        now: DateTime<Utc>,
    ) -> PolicyResult<Decision> {
        match &rule.kind {
            RuleKind::VersionStatus {} => self.version_status(scope),
            RuleKind::VersionSelector { selector } => {
                let doc = scope.version.selector_doc();
                if selector.matches(&doc)? {
                    Ok(Decision::allow("version matches selector"))
                } else {
                    Ok(Decision::deny(
                        format!("version {} does not match selector", scope.version.tag),
                        serde_json::json!({ "tag": scope.version.tag }),
                    ))
                }
            }
            RuleKind::VersionCooldown { interval_seconds } => {
                self.version_cooldown(scope, *interval_seconds, now)
            }
            RuleKind::DeploymentWindow {
                rrule,
                duration_seconds,
                allow_window,
                timezone,
            } => {
                let window = Window::parse(rrule, *duration_seconds, timezone.as_deref())?;
                Ok(deployment_window(&window, *allow_window, now))
            }
            RuleKind::AnyApproval { min_approvals } => self.any_approval(scope, *min_approvals),
            RuleKind::DeploymentDependency { depends_on } => {
                self.deployment_dependency(scope, depends_on)
            }
            RuleKind::EnvironmentProgression {
                predecessor_selector,
                min_success_percent,
                min_soak_seconds,
                max_age_seconds,
            } => self.environment_progression(
                scope,
                predecessor_selector,
                *min_success_percent,
                *min_soak_seconds,
                *max_age_seconds,
                now,
            ),
            RuleKind::GradualRollout {
                time_scale_interval_seconds,
                curve,
            } => self.gradual_rollout(scope, *time_scale_interval_seconds, *curve, now),
            RuleKind::Retry { .. } | RuleKind::Rollback {} | RuleKind::VerificationAction { .. } => {
                Ok(Decision::allow("action trigger"))
            }
        }
    }

    // ── Individual rules ───────────────────────────────────────────

    fn version_status(&self, scope: &EvalScope<'_>) -> PolicyResult<Decision> {
        match scope.version.status {
            VersionStatus::Ready => Ok(Decision::allow("version is ready")),
            VersionStatus::Paused => {
                let grandfathered = self
                    .store
                    .get_release_for_version(&scope.target(), &scope.version.id)?
                    .is_some();
                if grandfathered {
                    Ok(Decision::allow("paused version already released here"))
                } else {
                    Ok(Decision::deny(
                        "version is paused",
                        serde_json::json!({ "status": "paused" }),
                    ))
                }
            }
            status => Ok(Decision::deny(
                format!("version status is {status:?}"),
                serde_json::to_value(status).unwrap_or_default(),
            )),
        }
    }

    fn version_cooldown(
        &self,
        scope: &EvalScope<'_>,
        interval_seconds: u64,
        now: DateTime<Utc>,
    ) -> PolicyResult<Decision> {
        let prior = self
            .store
            .list_releases()?
            .into_iter()
            .filter(|r| {
                r.target.deployment_id == scope.deployment.id
                    && r.target.environment_id == scope.environment.id
            })
            .max_by_key(|r| r.created_at);
        let Some(prior) = prior else {
            return Ok(Decision::allow("no prior release"));
        };
        if prior.version_id == scope.version.id {
            return Ok(Decision::allow("same version as prior release"));
        }
        let cooldown_ends = prior.created_at + Duration::seconds(interval_seconds as i64);
        if now < cooldown_ends {
            Ok(Decision::deny_until(
                "cooling down after prior release",
                serde_json::json!({
                    "prior_version_id": prior.version_id,
                    "prior_created_at": prior.created_at.to_rfc3339(),
                }),
                cooldown_ends,
            ))
        } else {
            Ok(Decision::allow("cooldown elapsed"))
        }
    }

    fn any_approval(&self, scope: &EvalScope<'_>, min_approvals: u32) -> PolicyResult<Decision> {
        let records = self.store.list_approvals(&scope.version.id)?;
        let approvers: Vec<&str> = records
            .iter()
            .filter(|r| r.status == capstan_core::job::ApprovalStatus::Approved)
            .map(|r| r.user_id.as_str())
            .collect();
        if approvers.len() as u32 >= min_approvals {
            Ok(Decision::allow("sufficient approvals"))
        } else {
            Ok(Decision::deny(
                format!("{} of {min_approvals} required approvals", approvers.len()),
                serde_json::json!({
                    "approvers": approvers,
                    "min_approvals": min_approvals,
                }),
            ))
        }
    }

    fn deployment_dependency(
        &self,
        scope: &EvalScope<'_>,
        depends_on: &[capstan_core::policy::DependencySpec],
    ) -> PolicyResult<Decision> {
        let jobs = self.jobs_with_releases()?;
        let mut missing = Vec::new();

        for spec in depends_on {
            let mut satisfied = false;
            for (job, release) in &jobs {
                if job.status != JobStatus::Successful
                    || release.target.resource_id != scope.resource.id
                    || release.target.environment_id != scope.environment.id
                    || release.target.deployment_id != spec.deployment_id
                {
                    continue;
                }
                let version_ok = match &spec.version_selector {
                    Some(selector) => {
                        match self
                            .store
                            .get_version(&spec.deployment_id, &release.version_id)?
                        {
                            Some(version) => {
                                selector.matches(&version.selector_doc()).unwrap_or(false)
                            }
                            None => false,
                        }
                    }
                    None => true,
                };
                if version_ok {
                    satisfied = true;
                    break;
                }
            }
            if !satisfied {
                missing.push(spec.deployment_id.clone());
            }
        }

        if missing.is_empty() {
            Ok(Decision::allow("all upstream deployments satisfied"))
        } else {
            Ok(Decision::deny(
                format!("waiting on upstream deployments: {}", missing.join(", ")),
                serde_json::json!({ "missing": missing }),
            ))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn environment_progression(
        &self,
        scope: &EvalScope<'_>,
        predecessor_selector: &capstan_selector::Selector,
        min_success_percent: f64,
        min_soak_seconds: u64,
        max_age_seconds: Option<u64>,
        now: DateTime<Utc>,
    ) -> PolicyResult<Decision> {
        let mut predecessors: Vec<_> = self
            .store
            .list_environments_for_system(scope.workspace_id, &scope.environment.system_id)?
            .into_iter()
            .filter(|e| e.id != scope.environment.id)
            .filter(|e| predecessor_selector.matches(&e.selector_doc()).unwrap_or(false))
            .collect();
        predecessors.sort_by(|a, b| a.name.cmp(&b.name));
        let Some(predecessor) = predecessors.first() else {
            return Ok(Decision::deny(
                "no predecessor environment matches",
                serde_json::Value::Null,
            ));
        };

        let jobs: Vec<(Job, Release)> = self
            .jobs_with_releases()?
            .into_iter()
            .filter(|(_, r)| {
                r.target.environment_id == predecessor.id
                    && r.target.deployment_id == scope.deployment.id
                    && r.version_id == scope.version.id
            })
            .collect();

        let terminal: Vec<&(Job, Release)> =
            jobs.iter().filter(|(j, _)| j.status.is_terminal()).collect();
        if terminal.is_empty() {
            return Ok(Decision::deny(
                format!("no finished jobs in predecessor {}", predecessor.name),
                serde_json::json!({ "predecessor": predecessor.name }),
            ));
        }

        let successes: Vec<&&(Job, Release)> = terminal
            .iter()
            .filter(|(j, _)| j.status == JobStatus::Successful)
            .collect();
        let success_percent = successes.len() as f64 * 100.0 / terminal.len() as f64;
        let details = serde_json::json!({
            "predecessor": predecessor.name,
            "success_percent": success_percent,
            "min_success_percent": min_success_percent,
        });
        if success_percent < min_success_percent {
            return Ok(Decision::deny(
                format!("predecessor success rate {success_percent:.0}% below threshold"),
                details,
            ));
        }

        let first_success = successes.iter().map(|(j, _)| j.created_at).min();
        if let Some(first) = first_success {
            let soaked_at = first + Duration::seconds(min_soak_seconds as i64);
            if now < soaked_at {
                return Ok(Decision::deny_until(
                    "predecessor still soaking",
                    details,
                    soaked_at,
                ));
            }
        }

        if let Some(max_age) = max_age_seconds {
            let newest = successes.iter().map(|(j, _)| j.created_at).max();
            let fresh = newest
                .is_some_and(|t| now - t <= Duration::seconds(max_age as i64));
            if !fresh {
                return Ok(Decision::deny(
                    "predecessor success is too old",
                    details,
                ));
            }
        }

        Ok(Decision::allow("predecessor environment healthy"))
    }

    fn gradual_rollout(
        &self,
        scope: &EvalScope<'_>,
        time_scale_interval_seconds: u64,
        curve: capstan_core::policy::RolloutCurve,
        now: DateTime<Utc>,
    ) -> PolicyResult<Decision> {
        let mut peers = self
            .store
            .get_computed_targets(&scope.deployment.id, &scope.environment.id)?;
        if !peers.contains(&scope.resource.id) {
            peers.push(scope.resource.id.clone());
        }

        let (position, total) = rollout::position(&scope.resource.id, &scope.version.id, &peers)
            .unwrap_or((0, 1));
        let eligible = rollout::eligible_at(
            scope.version.created_at,
            position,
            total,
            time_scale_interval_seconds,
            curve,
        );
        let details = serde_json::json!({
            "position": position,
            "total": total,
            "eligible_at": eligible.to_rfc3339(),
        });
        if now >= eligible {
            Ok(Decision::allow(format!("rollout position {position} reached")))
        } else {
            Ok(Decision::deny_until(
                format!("rollout position {position} of {total} not yet reached"),
                details,
                eligible,
            ))
        }
    }

    fn jobs_with_releases(&self) -> PolicyResult<Vec<(Job, Release)>> {
        let mut joined = Vec::new();
        for job in self.store.list_jobs()? {
            if let Some(release) = self.store.get_release_by_id(&job.release_id)? {
                joined.push((job, release));
            }
        }
        Ok(joined)
    }
}

fn deployment_window(window: &Window, allow_window: bool, now: DateTime<Utc>) -> Decision {
    match (window.state_at(now), allow_window) {
        (WindowState::Inside { .. }, true) => Decision::allow("inside deployment window"),
        (WindowState::Inside { until }, false) => Decision::deny_until(
            "inside a blocked window",
            serde_json::json!({ "window_ends": until.to_rfc3339() }),
            until,
        ),
        (WindowState::Outside { next_start }, true) => match next_start {
            Some(start) => Decision::deny_until(
                "outside the deployment window",
                serde_json::json!({ "window_opens": start.to_rfc3339() }),
                start,
            ),
            None => Decision::deny("no upcoming deployment window", serde_json::Value::Null),
        },
        (WindowState::Outside { .. }, false) => Decision::allow("outside the blocked window"),
    }
}

/// The scope subset a rule kind reads, used as its memo key. A rule
/// listed with fewer fields is reused across candidates that differ
/// only in the unlisted ones.
fn declared_fields(kind: &RuleKind) -> &'static [ScopeField] {
    match kind {
        RuleKind::VersionStatus {} => &[
            ScopeField::Version,
            ScopeField::Resource,
            ScopeField::Environment,
            ScopeField::Deployment,
        ],
        RuleKind::VersionSelector { .. } | RuleKind::AnyApproval { .. } => &[ScopeField::Version],
        RuleKind::VersionCooldown { .. } => &[
            ScopeField::Deployment,
            ScopeField::Environment,
            ScopeField::Version,
        ],
        RuleKind::DeploymentWindow { .. } => &[],
        RuleKind::DeploymentDependency { .. } => &[ScopeField::Resource, ScopeField::Environment],
        RuleKind::EnvironmentProgression { .. } => &[
            ScopeField::Environment,
            ScopeField::Deployment,
            ScopeField::Version,
        ],
        RuleKind::GradualRollout { .. } => &[
            ScopeField::Resource,
            ScopeField::Environment,
            ScopeField::Deployment,
            ScopeField::Version,
        ],
        RuleKind::Retry { .. } | RuleKind::Rollback {} | RuleKind::VerificationAction { .. } => &[],
    }
}

/// Rule kinds evaluated at dispatch time rather than as gates.
fn is_action_trigger(kind: &RuleKind) -> bool {
    matches!(
        kind,
        RuleKind::Retry { .. } | RuleKind::Rollback {} | RuleKind::VerificationAction { .. }
    )
}

// ── Action-trigger helpers ─────────────────────────────────────────

/// Metric templates from every enabled verification-action rule firing
/// on the given trigger.
pub fn verification_metrics(policies: &[Policy], trigger: VerificationTrigger) -> Vec<MetricTemplate> {
    policies
        .iter()
        .filter(|p| p.enabled)
        .flat_map(|p| &p.rules)
        .filter_map(|rule| match &rule.kind {
            RuleKind::VerificationAction { trigger: t, metrics } if *t == trigger => Some(metrics),
            _ => None,
        })
        .flatten()
        .cloned()
        .collect()
}

/// Highest retry budget declared across the policies, if any.
pub fn retry_limit(policies: &[Policy]) -> Option<u32> {
    policies
        .iter()
        .filter(|p| p.enabled)
        .flat_map(|p| &p.rules)
        .filter_map(|rule| match rule.kind {
            RuleKind::Retry { max_retries } => Some(max_retries),
            _ => None,
        })
        .max()
}

/// Whether any policy enables rollback on job failure.
pub fn rollback_enabled(policies: &[Policy]) -> bool {
    policies
        .iter()
        .filter(|p| p.enabled)
        .flat_map(|p| &p.rules)
        .any(|rule| matches!(rule.kind, RuleKind::Rollback {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::entities::{
        Deployment, DeploymentVersion, Environment, Release, ReleaseTarget, Resource,
    };
    use capstan_core::job::{ApprovalStatus, UserApprovalRecord};
    use capstan_core::policy::{DependencySpec, RolloutCurve};
    use capstan_selector::Selector;
    use chrono::TimeZone;
    use std::collections::{BTreeMap, HashMap};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn environment(id: &str, name: &str) -> Environment {
        Environment {
            id: id.into(),
            workspace_id: "ws-1".into(),
            system_id: "sys-1".into(),
            name: name.into(),
            resource_selector: None,
        }
    }

    fn deployment() -> Deployment {
        Deployment {
            id: "dep-1".into(),
            workspace_id: "ws-1".into(),
            system_id: "sys-1".into(),
            name: "api".into(),
            resource_selector: None,
            job_agent_id: None,
            job_agent_config: serde_json::Value::Null,
        }
    }

    fn resource(id: &str) -> Resource {
        Resource {
            id: id.into(),
            workspace_id: "ws-1".into(),
            name: id.into(),
            kind: "service".into(),
            identifier: id.into(),
            version: "1".into(),
            metadata: HashMap::new(),
            config: serde_json::json!({}),
            created_at: t0(),
        }
    }

    fn version(id: &str, status: VersionStatus) -> DeploymentVersion {
        DeploymentVersion {
            id: id.into(),
            deployment_id: "dep-1".into(),
            tag: format!("tag-{id}"),
            status,
            config: serde_json::json!({}),
            job_agent_config: serde_json::json!({}),
            metadata: HashMap::new(),
            message: None,
            created_at: t0(),
        }
    }

    fn rule(id: &str, kind: RuleKind) -> PolicyRule {
        PolicyRule { id: id.into(), kind }
    }

    fn release(store: &Store, target: &ReleaseTarget, version_id: &str, created_at: DateTime<Utc>) -> Release {
        let release = Release {
            id: capstan_core::hash::release_id(target, version_id, &BTreeMap::new()),
            target: target.clone(),
            version_id: version_id.into(),
            variables: BTreeMap::new(),
            denied_reasons: Vec::new(),
            created_at,
        };
        store.put_release(&release).unwrap();
        release
    }

    fn job(store: &Store, id: &str, release_id: &str, status: JobStatus, created_at: DateTime<Utc>) {
        store
            .put_job(&Job {
                id: id.into(),
                release_id: release_id.into(),
                job_agent_id: None,
                job_agent_config: serde_json::Value::Null,
                status,
                created_at,
                updated_at: created_at,
            })
            .unwrap();
    }

    struct Fixture {
        store: Store,
        env: Environment,
        dep: Deployment,
        res: Resource,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Store::open_in_memory().unwrap(),
                env: environment("env-1", "prod"),
                dep: deployment(),
                res: resource("res-1"),
            }
        }

        fn scope<'a>(&'a self, version: &'a DeploymentVersion) -> EvalScope<'a> {
            EvalScope {
                workspace_id: "ws-1",
                environment: &self.env,
                deployment: &self.dep,
                resource: &self.res,
                version,
            }
        }
    }

    #[test]
    fn ready_version_allowed_others_denied() {
        let fx = Fixture::new();
        let engine = PolicyEngine::new(&fx.store);
        let gate = rule("r-status", RuleKind::VersionStatus {});

        let ready = version("v-ready", VersionStatus::Ready);
        assert!(engine.evaluate_rule(&gate, &fx.scope(&ready), t0()).unwrap().allowed);

        for status in [
            VersionStatus::Building,
            VersionStatus::Failed,
            VersionStatus::Rejected,
            VersionStatus::Unspecified,
        ] {
            let v = version("v-bad", status);
            let decision = engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap();
            assert!(!decision.allowed, "{status:?} must deny");
        }
    }

    #[test]
    fn paused_version_grandfathered_by_existing_release() {
        let fx = Fixture::new();
        let paused = version("v2", VersionStatus::Paused);
        let target = fx.scope(&paused).target();
        release(&fx.store, &target, "v2", t0());

        let engine = PolicyEngine::new(&fx.store);
        let gate = rule("r-status", RuleKind::VersionStatus {});
        assert!(engine.evaluate_rule(&gate, &fx.scope(&paused), t0()).unwrap().allowed);

        // A different target without that release history is denied.
        let other = Fixture {
            res: resource("res-2"),
            ..Fixture::new()
        };
        // Evaluate against the original store, where res-2 has no release.
        let scope = EvalScope {
            workspace_id: "ws-1",
            environment: &other.env,
            deployment: &other.dep,
            resource: &other.res,
            version: &paused,
        };
        let decision = engine.evaluate_rule(&gate, &scope, t0()).unwrap();
        assert!(!decision.allowed);
    }

    #[test]
    fn version_selector_gate() {
        let fx = Fixture::new();
        let engine = PolicyEngine::new(&fx.store);
        let gate = rule(
            "r-sel",
            RuleKind::VersionSelector {
                selector: Selector::Cel("tag.startsWith(\"tag-v\")".into()),
            },
        );
        let v = version("v1", VersionStatus::Ready);
        assert!(engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap().allowed);

        let gate = rule(
            "r-sel2",
            RuleKind::VersionSelector {
                selector: Selector::Cel("tag == \"nope\"".into()),
            },
        );
        assert!(!engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap().allowed);
    }

    #[test]
    fn cooldown_denies_recent_different_version() {
        let fx = Fixture::new();
        let v1 = version("v1", VersionStatus::Ready);
        let target = fx.scope(&v1).target();
        release(&fx.store, &target, "v1", t0());

        let engine = PolicyEngine::new(&fx.store);
        let gate = rule("r-cool", RuleKind::VersionCooldown { interval_seconds: 600 });

        // Different version inside the interval: deny with the exact
        // cooldown end as the retry time.
        let v2 = version("v2", VersionStatus::Ready);
        let now = t0() + Duration::seconds(120);
        let decision = engine.evaluate_rule(&gate, &fx.scope(&v2), now).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_at, Some(t0() + Duration::seconds(600)));

        // Same version is always allowed.
        assert!(engine.evaluate_rule(&gate, &fx.scope(&v1), now).unwrap().allowed);

        // After the interval the denial lifts.
        let later = t0() + Duration::seconds(601);
        let engine = PolicyEngine::new(&fx.store);
        assert!(engine.evaluate_rule(&gate, &fx.scope(&v2), later).unwrap().allowed);
    }

    #[test]
    fn approval_rule_counts_approved_users() {
        let fx = Fixture::new();
        let v = version("v1", VersionStatus::Ready);
        for (user, status) in [
            ("alice", ApprovalStatus::Approved),
            ("bob", ApprovalStatus::Rejected),
        ] {
            fx.store
                .put_approval(&UserApprovalRecord {
                    version_id: "v1".into(),
                    user_id: user.into(),
                    status,
                    approved_at: Some(t0()),
                    reason: None,
                })
                .unwrap();
        }

        let engine = PolicyEngine::new(&fx.store);
        let gate = rule("r-appr", RuleKind::AnyApproval { min_approvals: 2 });
        let decision = engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.details["min_approvals"], 2);
        assert_eq!(decision.details["approvers"][0], "alice");

        let gate = rule("r-appr1", RuleKind::AnyApproval { min_approvals: 1 });
        assert!(engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap().allowed);
    }

    #[test]
    fn memo_survives_store_changes_within_engine_lifetime() {
        let fx = Fixture::new();
        let v = version("v1", VersionStatus::Ready);
        let engine = PolicyEngine::new(&fx.store);
        let gate = rule("r-appr", RuleKind::AnyApproval { min_approvals: 1 });

        assert!(!engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap().allowed);

        fx.store
            .put_approval(&UserApprovalRecord {
                version_id: "v1".into(),
                user_id: "alice".into(),
                status: ApprovalStatus::Approved,
                approved_at: Some(t0()),
                reason: None,
            })
            .unwrap();

        // Same engine: memoized denial. Fresh engine: sees the approval.
        assert!(!engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap().allowed);
        let fresh = PolicyEngine::new(&fx.store);
        assert!(fresh.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap().allowed);
    }

    #[test]
    fn dependency_requires_successful_upstream_job() {
        let fx = Fixture::new();
        let v = version("v1", VersionStatus::Ready);
        let gate = rule(
            "r-dep",
            RuleKind::DeploymentDependency {
                depends_on: vec![DependencySpec {
                    deployment_id: "dep-db".into(),
                    version_selector: None,
                }],
            },
        );

        let engine = PolicyEngine::new(&fx.store);
        let decision = engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.details["missing"][0], "dep-db");

        // A successful upstream job for the same resource+environment
        // satisfies the dependency.
        let upstream_target = ReleaseTarget {
            resource_id: "res-1".into(),
            environment_id: "env-1".into(),
            deployment_id: "dep-db".into(),
        };
        let upstream = release(&fx.store, &upstream_target, "db-v1", t0());
        job(&fx.store, "job-1", &upstream.id, JobStatus::Successful, t0());

        let engine = PolicyEngine::new(&fx.store);
        assert!(engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap().allowed);
    }

    #[test]
    fn progression_requires_predecessor_success_and_soak() {
        let fx = Fixture::new();
        let staging = environment("env-0", "staging");
        fx.store.put_environment(&staging).unwrap();
        fx.store.put_environment(&fx.env).unwrap();

        let v = version("v1", VersionStatus::Ready);
        let gate = rule(
            "r-prog",
            RuleKind::EnvironmentProgression {
                predecessor_selector: Selector::Cel("name == \"staging\"".into()),
                min_success_percent: 100.0,
                min_soak_seconds: 300,
                max_age_seconds: None,
            },
        );

        // No jobs yet: deny.
        let engine = PolicyEngine::new(&fx.store);
        assert!(!engine.evaluate_rule(&gate, &fx.scope(&v), t0()).unwrap().allowed);

        let staging_target = ReleaseTarget {
            resource_id: "res-1".into(),
            environment_id: "env-0".into(),
            deployment_id: "dep-1".into(),
        };
        let staging_release = release(&fx.store, &staging_target, "v1", t0());
        job(&fx.store, "job-1", &staging_release.id, JobStatus::Successful, t0());

        // Inside the soak period: deny until the soak end.
        let engine = PolicyEngine::new(&fx.store);
        let decision = engine
            .evaluate_rule(&gate, &fx.scope(&v), t0() + Duration::seconds(60))
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_at, Some(t0() + Duration::seconds(300)));

        // Past the soak period: allow.
        let engine = PolicyEngine::new(&fx.store);
        assert!(
            engine
                .evaluate_rule(&gate, &fx.scope(&v), t0() + Duration::seconds(301))
                .unwrap()
                .allowed
        );
    }

    #[test]
    fn rollout_denies_until_deterministic_position_time() {
        let fx = Fixture::new();
        let peers: Vec<String> = (0..20).map(|i| format!("res-{i}")).collect();
        fx.store
            .put_computed_targets("dep-1", "env-1", &peers)
            .unwrap();

        let v = version("v1", VersionStatus::Ready);
        // Find the resource ranked at position 5 for this version.
        let (target_res, _) = peers
            .iter()
            .map(|id| (id.clone(), rollout::position(id, "v1", &peers).unwrap().0))
            .find(|(_, pos)| *pos == 5)
            .map(|(id, pos)| (id, pos))
            .unwrap();

        let res = resource(&target_res);
        let scope = EvalScope {
            workspace_id: "ws-1",
            environment: &fx.env,
            deployment: &fx.dep,
            resource: &res,
            version: &v,
        };
        let gate = rule(
            "r-roll",
            RuleKind::GradualRollout {
                time_scale_interval_seconds: 60,
                curve: RolloutCurve::Linear,
            },
        );

        // At start + 3 intervals the position-5 target is denied and
        // requeued for exactly start + 5 intervals.
        let engine = PolicyEngine::new(&fx.store);
        let now = t0() + Duration::seconds(180);
        let decision = engine.evaluate_rule(&gate, &scope, now).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_at, Some(t0() + Duration::seconds(300)));

        // Once the time arrives it stays allowed.
        let engine = PolicyEngine::new(&fx.store);
        let decision = engine
            .evaluate_rule(&gate, &scope, t0() + Duration::seconds(300))
            .unwrap();
        assert!(decision.allowed);
    }

    #[test]
    fn verdict_retry_at_requires_every_denial_timed() {
        let timed = Denial {
            rule_id: "a".into(),
            decision: Decision::deny_until("d", serde_json::Value::Null, t0()),
        };
        let untimed = Denial {
            rule_id: "b".into(),
            decision: Decision::deny("d", serde_json::Value::Null),
        };

        let verdict = Verdict {
            denials: vec![timed.clone()],
        };
        assert_eq!(verdict.retry_at(), Some(t0()));

        let verdict = Verdict {
            denials: vec![timed, untimed],
        };
        assert_eq!(verdict.retry_at(), None);
    }

    #[test]
    fn evaluate_skips_action_triggers_and_collects_denials() {
        let fx = Fixture::new();
        let v = version("v1", VersionStatus::Failed);
        let policies = vec![Policy {
            id: "pol-1".into(),
            workspace_id: "ws-1".into(),
            name: "gates".into(),
            selector: None,
            priority: 0,
            enabled: true,
            rules: vec![
                rule("r-status", RuleKind::VersionStatus {}),
                rule("r-retry", RuleKind::Retry { max_retries: 3 }),
            ],
            metadata: HashMap::new(),
        }];

        let engine = PolicyEngine::new(&fx.store);
        let verdict = engine.evaluate(&policies, &fx.scope(&v), t0()).unwrap();
        assert_eq!(verdict.denials.len(), 1);
        assert_eq!(verdict.denials[0].rule_id, "r-status");
        assert!(!verdict.allowed());
    }

    #[test]
    fn applicable_policies_filter_by_selector_and_enabled() {
        let fx = Fixture::new();
        let v = version("v1", VersionStatus::Ready);
        let base = Policy {
            id: "pol-1".into(),
            workspace_id: "ws-1".into(),
            name: "match".into(),
            selector: Some(Selector::Cel("environment.name == \"prod\"".into())),
            priority: 1,
            enabled: true,
            rules: Vec::new(),
            metadata: HashMap::new(),
        };
        fx.store.put_policy(&base).unwrap();
        fx.store
            .put_policy(&Policy {
                id: "pol-2".into(),
                name: "no-match".into(),
                selector: Some(Selector::Cel("environment.name == \"dev\"".into())),
                ..base.clone()
            })
            .unwrap();
        fx.store
            .put_policy(&Policy {
                id: "pol-3".into(),
                name: "disabled".into(),
                selector: None,
                enabled: false,
                ..base.clone()
            })
            .unwrap();

        let engine = PolicyEngine::new(&fx.store);
        let applicable = engine.applicable_policies(&fx.scope(&v)).unwrap();
        let ids: Vec<&str> = applicable.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["pol-1"]);
    }

    #[test]
    fn action_trigger_helpers() {
        let policies = vec![Policy {
            id: "pol-1".into(),
            workspace_id: "ws-1".into(),
            name: "actions".into(),
            selector: None,
            priority: 0,
            enabled: true,
            rules: vec![
                rule("r-retry", RuleKind::Retry { max_retries: 3 }),
                rule("r-rollback", RuleKind::Rollback {}),
                rule(
                    "r-verify",
                    RuleKind::VerificationAction {
                        trigger: VerificationTrigger::JobCreated,
                        metrics: vec![MetricTemplate {
                            name: "error-rate".into(),
                            provider: serde_json::json!({"type": "prometheus"}),
                            interval_seconds: 30,
                            count: 3,
                            success_condition: "result.ok == true".into(),
                            success_threshold: None,
                            failure_condition: None,
                            failure_threshold: None,
                        }],
                    },
                ),
            ],
            metadata: HashMap::new(),
        }];

        assert_eq!(retry_limit(&policies), Some(3));
        assert!(rollback_enabled(&policies));
        let metrics = verification_metrics(&policies, VerificationTrigger::JobCreated);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "error-rate");
    }
}
