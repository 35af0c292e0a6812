//! Evaluation scope and memo keys.
//!
//! A rule reads only part of the scope and declares which part, so the
//! engine can memoize its decision by the concrete ids of the declared
//! fields and skip re-evaluation when an unrelated field changes (for
//! example a new candidate variable resolution).

use capstan_core::entities::{
    Deployment, DeploymentVersion, Environment, ReleaseTarget, Resource,
};

/// The entities a rule may read during evaluation.
#[derive(Debug, Clone)]
pub struct EvalScope<'a> {
    pub workspace_id: &'a str,
    pub environment: &'a Environment,
    pub deployment: &'a Deployment,
    pub resource: &'a Resource,
    pub version: &'a DeploymentVersion,
}

impl EvalScope<'_> {
    /// The release target under evaluation.
    pub fn target(&self) -> ReleaseTarget {
        ReleaseTarget {
            resource_id: self.resource.id.clone(),
            environment_id: self.environment.id.clone(),
            deployment_id: self.deployment.id.clone(),
        }
    }

    /// Document view matched by policy selectors.
    pub fn doc(&self) -> serde_json::Value {
        serde_json::json!({
            "workspaceId": self.workspace_id,
            "environment": self.environment.selector_doc(),
            "deployment": self.deployment.selector_doc(),
            "resource": self.resource.selector_doc(),
        })
    }
}

/// Scope fields a rule can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeField {
    Workspace,
    Environment,
    Deployment,
    Resource,
    Version,
}

/// Memo key from a rule id and its declared scope subset.
pub fn memo_key(rule_id: &str, fields: &[ScopeField], scope: &EvalScope<'_>) -> String {
    let mut key = String::from(rule_id);
    for field in fields {
        key.push('|');
        key.push_str(match field {
            ScopeField::Workspace => scope.workspace_id,
            ScopeField::Environment => &scope.environment.id,
            ScopeField::Deployment => &scope.deployment.id,
            ScopeField::Resource => &scope.resource.id,
            ScopeField::Version => &scope.version.id,
        });
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::entities::VersionStatus;
    use chrono::Utc;
    use std::collections::HashMap;

    fn fixtures() -> (Environment, Deployment, Resource, DeploymentVersion) {
        let env = Environment {
            id: "env-1".into(),
            workspace_id: "ws-1".into(),
            system_id: "sys-1".into(),
            name: "prod".into(),
            resource_selector: None,
        };
        let dep = Deployment {
            id: "dep-1".into(),
            workspace_id: "ws-1".into(),
            system_id: "sys-1".into(),
            name: "api".into(),
            resource_selector: None,
            job_agent_id: None,
            job_agent_config: serde_json::Value::Null,
        };
        let res = Resource {
            id: "res-1".into(),
            workspace_id: "ws-1".into(),
            name: "api".into(),
            kind: "service".into(),
            identifier: "api".into(),
            version: "1".into(),
            metadata: HashMap::new(),
            config: serde_json::json!({}),
            created_at: Utc::now(),
        };
        let version = DeploymentVersion {
            id: "ver-1".into(),
            deployment_id: "dep-1".into(),
            tag: "1.0.0".into(),
            status: VersionStatus::Ready,
            config: serde_json::json!({}),
            job_agent_config: serde_json::json!({}),
            metadata: HashMap::new(),
            message: None,
            created_at: Utc::now(),
        };
        (env, dep, res, version)
    }

    #[test]
    fn memo_key_uses_only_declared_fields() {
        let (env, dep, res, version) = fixtures();
        let scope = EvalScope {
            workspace_id: "ws-1",
            environment: &env,
            deployment: &dep,
            resource: &res,
            version: &version,
        };

        let narrow = memo_key("r-1", &[ScopeField::Version], &scope);
        assert_eq!(narrow, "r-1|ver-1");

        let wide = memo_key(
            "r-1",
            &[ScopeField::Resource, ScopeField::Version],
            &scope,
        );
        assert_eq!(wide, "r-1|res-1|ver-1");
    }

    #[test]
    fn scope_doc_nests_entity_documents() {
        let (env, dep, res, version) = fixtures();
        let scope = EvalScope {
            workspace_id: "ws-1",
            environment: &env,
            deployment: &dep,
            resource: &res,
            version: &version,
        };
        let doc = scope.doc();
        assert_eq!(doc["environment"]["name"], "prod");
        assert_eq!(doc["resource"]["kind"], "service");
    }
}
