//! Policy model — a selector-scoped bundle of rules.
//!
//! A target passes a policy evaluation iff every enabled rule allows
//! it. `PolicyRule` is a tagged union discriminated by rule kind;
//! evaluators dispatch on the tag.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use capstan_selector::Selector;

use crate::entities::{DeploymentId, WorkspaceId};

/// A named, prioritized bundle of rules scoped by a selector over the
/// evaluation scope. Priority orders denial messages only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub selector: Option<Selector>,
    pub priority: i32,
    pub enabled: bool,
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// One rule inside a policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub id: String,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// The rule kinds understood by the policy engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Allow iff the version is `ready`, or `paused` with an existing
    /// release of that version for the exact target.
    VersionStatus {},
    /// Allow iff the selector matches the version document.
    VersionSelector { selector: Selector },
    /// Deny while a prior release for this deployment+environment is
    /// younger than the interval and the version differs.
    VersionCooldown { interval_seconds: u64 },
    /// Recurrence window gate. `allow_window = true` allows only inside
    /// the window; `false` denies inside it. Denials carry the next
    /// flip time so the scheduler can requeue at the edge.
    DeploymentWindow {
        rrule: String,
        duration_seconds: u64,
        allow_window: bool,
        /// UTC offset like "+02:00"; absent means UTC.
        timezone: Option<String>,
    },
    /// Allow iff at least `min_approvals` users approved the version.
    AnyApproval { min_approvals: u32 },
    /// Deny unless every upstream deployment has a successful job for
    /// the same resource+environment, optionally for a version matching
    /// the predicate.
    DeploymentDependency { depends_on: Vec<DependencySpec> },
    /// Deny unless the predecessor environment reached the success
    /// criteria.
    EnvironmentProgression {
        predecessor_selector: Selector,
        min_success_percent: f64,
        min_soak_seconds: u64,
        max_age_seconds: Option<u64>,
    },
    /// Pace the version across matching resources by deterministic
    /// position along a time curve.
    GradualRollout {
        time_scale_interval_seconds: u64,
        #[serde(default)]
        curve: RolloutCurve,
    },
    /// Action trigger: how many times a failed job may be retried.
    Retry { max_retries: u32 },
    /// Action trigger: roll back to the previous successful version on
    /// job failure.
    Rollback {},
    /// Action trigger: launch verification metrics on a job transition.
    VerificationAction {
        trigger: VerificationTrigger,
        metrics: Vec<MetricTemplate>,
    },
}

/// One upstream dependency of a deployment-dependency rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencySpec {
    pub deployment_id: DeploymentId,
    pub version_selector: Option<Selector>,
}

/// Shape of the rollout pacing curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RolloutCurve {
    #[default]
    Linear,
    Exponential,
}

/// Job transition that fires a verification action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTrigger {
    JobCreated,
}

/// Metric definition carried by a verification-action rule; turned
/// into a concrete `VerificationMetric` when the trigger fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricTemplate {
    pub name: String,
    pub provider: serde_json::Value,
    pub interval_seconds: u64,
    pub count: u32,
    pub success_condition: String,
    pub success_threshold: Option<u32>,
    pub failure_condition: Option<String>,
    pub failure_threshold: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_kind_tagged_by_type() {
        let rule = PolicyRule {
            id: "r-1".into(),
            kind: RuleKind::AnyApproval { min_approvals: 2 },
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["type"], "any_approval");
        assert_eq!(json["min_approvals"], 2);

        let back: PolicyRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn rollout_curve_defaults_linear() {
        let json = serde_json::json!({
            "id": "r-2",
            "type": "gradual_rollout",
            "time_scale_interval_seconds": 60,
        });
        let rule: PolicyRule = serde_json::from_value(json).unwrap();
        match rule.kind {
            RuleKind::GradualRollout { curve, .. } => assert_eq!(curve, RolloutCurve::Linear),
            _ => panic!("expected gradual_rollout"),
        }
    }
}
