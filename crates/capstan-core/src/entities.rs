//! Core workspace entities.
//!
//! All entities are scoped to a workspace; workspaces are independent
//! shards and nothing here queries across them. Types are serializable
//! to/from JSON for storage in redb tables.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use capstan_selector::Selector;

/// Workspace-scoped identifier aliases.
pub type WorkspaceId = String;
pub type SystemId = String;
pub type ResourceId = String;
pub type EnvironmentId = String;
pub type DeploymentId = String;
pub type VersionId = String;
pub type ReleaseId = String;

// ── Workspace & system ─────────────────────────────────────────────

/// Tenant root. All other ids are scoped to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Informational grouping of environments and deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct System {
    pub id: SystemId,
    pub workspace_id: WorkspaceId,
    pub name: String,
}

// ── Resource ───────────────────────────────────────────────────────

/// The unit matched by selectors.
///
/// `(workspace_id, kind, identifier)` uniquely identifies a resource;
/// `id` is the stable surrogate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub kind: String,
    pub identifier: String,
    pub version: String,
    pub metadata: HashMap<String, String>,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    /// Document view used by selector evaluation.
    pub fn selector_doc(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "kind": self.kind,
            "identifier": self.identifier,
            "version": self.version,
            "workspaceId": self.workspace_id,
            "metadata": self.metadata,
            "config": self.config,
        })
    }
}

// ── Environment & deployment ───────────────────────────────────────

/// A named scope within a system. The optional selector defines which
/// resources belong to it; an absent selector means "no resources."
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: EnvironmentId,
    pub workspace_id: WorkspaceId,
    pub system_id: SystemId,
    pub name: String,
    pub resource_selector: Option<Selector>,
}

impl Environment {
    pub fn selector_doc(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "systemId": self.system_id,
            "workspaceId": self.workspace_id,
        })
    }
}

/// A workload target. Its selector narrows which of its system's
/// resources it applies to; absent means "all resources belonging to
/// the environment."
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub workspace_id: WorkspaceId,
    pub system_id: SystemId,
    pub name: String,
    pub resource_selector: Option<Selector>,
    pub job_agent_id: Option<String>,
    #[serde(default)]
    pub job_agent_config: serde_json::Value,
}

impl Deployment {
    pub fn selector_doc(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "systemId": self.system_id,
            "workspaceId": self.workspace_id,
        })
    }
}

// ── Version ────────────────────────────────────────────────────────

/// Deployability status of a version.
///
/// `Ready` is the only unconditionally deployable state; `Paused` is
/// deployable only to targets that already run a release of this
/// version. Everything else is non-deployable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Unspecified,
    Building,
    Ready,
    Failed,
    Rejected,
    Paused,
}

/// A buildable artifact of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentVersion {
    pub id: VersionId,
    pub deployment_id: DeploymentId,
    pub tag: String,
    pub status: VersionStatus,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub job_agent_config: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeploymentVersion {
    pub fn selector_doc(&self) -> serde_json::Value {
        serde_json::json!({
            "tag": self.tag,
            "createdAt": self.created_at.to_rfc3339(),
            "metadata": self.metadata,
            "config": self.config,
        })
    }
}

// ── Release target & release ───────────────────────────────────────

/// Virtual tuple that exists iff the resource is currently matched by
/// both the environment's and deployment's selectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReleaseTarget {
    pub resource_id: ResourceId,
    pub environment_id: EnvironmentId,
    pub deployment_id: DeploymentId,
}

impl ReleaseTarget {
    /// Canonical `resource:environment:deployment` key.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.resource_id, self.environment_id, self.deployment_id
        )
    }

    /// Parse a canonical key back into a target.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, ':');
        Some(Self {
            resource_id: parts.next()?.to_string(),
            environment_id: parts.next()?.to_string(),
            deployment_id: parts.next()?.to_string(),
        })
    }
}

/// Desired state for a release target: a chosen version plus resolved
/// variables. `id` is a canonical hash so downstream can dedupe
/// re-dispatch of an identical computation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub id: ReleaseId,
    pub target: ReleaseTarget,
    pub version_id: VersionId,
    /// Resolved literal values, keyed by variable name. BTreeMap keeps
    /// the serialized form key-ordered for stable hashing.
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Human-readable reasons this target was denied other candidates.
    #[serde(default)]
    pub denied_reasons: Vec<DeniedReason>,
    pub created_at: DateTime<Utc>,
}

/// A policy denial surfaced on the release for observability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeniedReason {
    pub rule_id: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

// ── Variables ──────────────────────────────────────────────────────

/// Tagged value union: literal, cross-entity reference, or an opaque
/// sensitive marker that this core never resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VarValue {
    Literal {
        value: serde_json::Value,
    },
    Reference {
        /// Name of the relation to follow from the current resource.
        reference: String,
        /// Path segments on the related entity, e.g.
        /// `["metadata", "team"]` or `["config", "db", "host"]`.
        path: Vec<String>,
    },
    Sensitive {
        value_hash: String,
    },
}

/// A variable declared on a deployment, with an optional default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentVariable {
    pub id: String,
    pub deployment_id: DeploymentId,
    pub key: String,
    pub default_value: Option<VarValue>,
}

/// A candidate value for a deployment variable. Higher priority wins;
/// the selector scopes which resources the value applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentVariableValue {
    pub id: String,
    pub deployment_variable_id: String,
    pub resource_selector: Option<Selector>,
    pub priority: i32,
    pub value: VarValue,
}

/// Per-resource override; always wins over deployment variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceVariable {
    pub resource_id: ResourceId,
    pub key: String,
    pub value: VarValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_target_key_roundtrip() {
        let target = ReleaseTarget {
            resource_id: "res-1".into(),
            environment_id: "env-1".into(),
            deployment_id: "dep-1".into(),
        };
        let key = target.key();
        assert_eq!(key, "res-1:env-1:dep-1");
        assert_eq!(ReleaseTarget::parse(&key), Some(target));
    }

    #[test]
    fn release_target_parse_rejects_short_key() {
        assert!(ReleaseTarget::parse("only:two").is_none());
    }

    #[test]
    fn var_value_tagged_serialization() {
        let v = VarValue::Reference {
            reference: "cluster".into(),
            path: vec!["metadata".into(), "region".into()],
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["type"], "reference");
        assert_eq!(json["path"][0], "metadata");

        let back: VarValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn version_status_snake_case() {
        let json = serde_json::to_string(&VersionStatus::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
    }

    #[test]
    fn resource_selector_doc_fields() {
        let res = Resource {
            id: "res-1".into(),
            workspace_id: "ws-1".into(),
            name: "api".into(),
            kind: "service".into(),
            identifier: "api-prod".into(),
            version: "1".into(),
            metadata: HashMap::from([("region".to_string(), "us-east-1".to_string())]),
            config: serde_json::json!({"replicas": 3}),
            created_at: Utc::now(),
        };
        let doc = res.selector_doc();
        assert_eq!(doc["kind"], "service");
        assert_eq!(doc["metadata"]["region"], "us-east-1");
        assert_eq!(doc["config"]["replicas"], 3);
    }
}
