//! redb table definitions.
//!
//! All tables map string composite keys to JSON-serialized values.
//! Key shapes are noted per table; prefix scans rely on them.

use redb::TableDefinition;

/// `workspace_id` → Workspace
pub const WORKSPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("workspaces");

/// `workspace_id/system_id` → System
pub const SYSTEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("systems");

/// `workspace_id/resource_id` → Resource
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");

/// `workspace_id/environment_id` → Environment
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// `workspace_id/deployment_id` → Deployment
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// `deployment_id/version_id` → DeploymentVersion
pub const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");

/// `target_key` → Release (current desired release per target)
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// `target_key/version_id` → Release (latest release of that version
/// for that target; backs the paused-version grandfather check)
pub const RELEASE_HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("release_history");

/// `release_id` → Release (lookup for job → target joins)
pub const RELEASE_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("release_index");

/// `deployment_id/key` → DeploymentVariable
pub const DEPLOYMENT_VARIABLES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("deployment_variables");

/// `deployment_variable_id/value_id` → DeploymentVariableValue
pub const DEPLOYMENT_VARIABLE_VALUES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("deployment_variable_values");

/// `resource_id/key` → ResourceVariable
pub const RESOURCE_VARIABLES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("resource_variables");

/// `workspace_id/policy_id` → Policy
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");

/// `version_id/user_id` → UserApprovalRecord
pub const APPROVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("approvals");

/// `job_id` → Job
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// `verification_id` → JobVerification
pub const VERIFICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("verifications");

/// `metric_id` → VerificationMetric
pub const VERIFICATION_METRICS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("verification_metrics");

/// `metric_id/measured_at_millis(020)/measurement_id` → Measurement
pub const MEASUREMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("measurements");

/// `deployment_id/environment_id` → Vec<ResourceId> (last computed
/// matching set, diffed by the selector-eval controller)
pub const COMPUTED_TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("computed_targets");
