//! Variable resolution for a release target.
//!
//! Per key the chain is: resource variable override, then deployment
//! variable values whose selector matches the resource (highest
//! priority first, falling through candidates that do not resolve),
//! then the declared default, then omission.

use std::collections::BTreeMap;

use capstan_core::entities::{Deployment, Resource, VarValue};
use capstan_store::Store;
use tracing::debug;

use crate::error::{VarsError, VarsResult};
use crate::relations::RelationSource;

/// JSON marker carried in place of a sensitive value. Downstream
/// holders of the decryption key look this key up.
pub const SENSITIVE_KEY: &str = "$sensitive";

/// Opaque marker propagated for sensitive values.
pub fn sensitive_marker(value_hash: &str) -> serde_json::Value {
    serde_json::json!({ SENSITIVE_KEY: value_hash })
}

enum Candidate {
    Resolved(serde_json::Value),
    Sensitive(String),
    Failed(String),
}

/// Resolves the variable map for `(deployment, resource)` pairs.
pub struct VariableResolver<'a, R: RelationSource> {
    store: &'a Store,
    relations: R,
}

impl<'a, R: RelationSource> VariableResolver<'a, R> {
    pub fn new(store: &'a Store, relations: R) -> Self {
        Self { store, relations }
    }

    /// Resolve every declared deployment variable for the resource.
    /// Keys with no resolvable candidate and no default are omitted.
    /// Sensitive winners appear as opaque markers.
    pub fn resolve(
        &self,
        deployment: &Deployment,
        resource: &Resource,
    ) -> VarsResult<BTreeMap<String, serde_json::Value>> {
        let mut resolved = BTreeMap::new();
        let resource_doc = resource.selector_doc();

        for variable in self.store.list_deployment_variables(&deployment.id)? {
            // 1. Resource override.
            let override_value = self
                .store
                .get_resource_variable(&resource.id, &variable.key)?;
            if let Some(rv) = override_value {
                match self.try_value(&rv.value, resource)? {
                    Candidate::Resolved(value) => {
                        resolved.insert(variable.key, value);
                        continue;
                    }
                    Candidate::Sensitive(hash) => {
                        resolved.insert(variable.key, sensitive_marker(&hash));
                        continue;
                    }
                    Candidate::Failed(reason) => {
                        debug!(key = %variable.key, reason, "resource override did not resolve");
                    }
                }
            }

            // 2. Deployment values, highest priority first.
            let mut values = self.store.list_variable_values(&variable.id)?;
            values.sort_by(|a, b| b.priority.cmp(&a.priority));

            let mut winner = None;
            for value in values {
                let applies = match &value.resource_selector {
                    Some(selector) => selector.matches(&resource_doc).unwrap_or(false),
                    None => true,
                };
                if !applies {
                    continue;
                }
                match self.try_value(&value.value, resource)? {
                    Candidate::Resolved(v) => {
                        winner = Some(v);
                        break;
                    }
                    Candidate::Sensitive(hash) => {
                        winner = Some(sensitive_marker(&hash));
                        break;
                    }
                    Candidate::Failed(reason) => {
                        debug!(key = %variable.key, value = %value.id, reason, "candidate did not resolve");
                    }
                }
            }
            if let Some(value) = winner {
                resolved.insert(variable.key, value);
                continue;
            }

            // 3. Default, else omit.
            if let Some(default) = &variable.default_value {
                match self.try_value(default, resource)? {
                    Candidate::Resolved(v) => {
                        resolved.insert(variable.key, v);
                    }
                    Candidate::Sensitive(hash) => {
                        resolved.insert(variable.key, sensitive_marker(&hash));
                    }
                    Candidate::Failed(reason) => {
                        debug!(key = %variable.key, reason, "default did not resolve; key omitted");
                    }
                }
            }
        }
        Ok(resolved)
    }

    /// Resolve a single value. Sensitive values and unresolvable
    /// references are errors here; the map-level chain in [`resolve`]
    /// handles fall-through instead.
    ///
    /// [`resolve`]: VariableResolver::resolve
    pub fn resolve_value(
        &self,
        value: &VarValue,
        resource: &Resource,
    ) -> VarsResult<serde_json::Value> {
        match self.try_value(value, resource)? {
            Candidate::Resolved(v) => Ok(v),
            Candidate::Sensitive(value_hash) => {
                Err(VarsError::SensitiveNotResolvable { value_hash })
            }
            Candidate::Failed(reason) => Err(VarsError::Unresolvable(reason)),
        }
    }

    fn try_value(&self, value: &VarValue, resource: &Resource) -> VarsResult<Candidate> {
        match value {
            VarValue::Literal { value } => Ok(Candidate::Resolved(value.clone())),
            VarValue::Sensitive { value_hash } => Ok(Candidate::Sensitive(value_hash.clone())),
            VarValue::Reference { reference, path } => {
                let related = self.relations.related(resource, reference)?;
                let Some(entity) = related.first() else {
                    return Ok(Candidate::Failed(format!(
                        "relation {reference:?} has no entities"
                    )));
                };
                match traverse(entity, path) {
                    Some(v) => Ok(Candidate::Resolved(v.clone())),
                    None => Ok(Candidate::Failed(format!(
                        "path {} missing on relation {reference:?}",
                        path.join(".")
                    ))),
                }
            }
        }
    }
}

/// Walk path segments on a document: properties (`name`, `createdAt`,
/// ...), `metadata[key]`, and `config[k1][k2]...` all reduce to object
/// indexing. Null results count as missing.
fn traverse<'v>(doc: &'v serde_json::Value, path: &[String]) -> Option<&'v serde_json::Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = doc;
    for segment in path {
        current = current.get(segment)?;
    }
    if current.is_null() { None } else { Some(current) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::entities::{
        DeploymentVariable, DeploymentVariableValue, ResourceVariable,
    };
    use capstan_selector::Selector;
    use chrono::Utc;
    use std::collections::HashMap;

    use crate::relations::StoreRelations;

    fn resource(id: &str, region: &str) -> Resource {
        Resource {
            id: id.to_string(),
            workspace_id: "ws-1".to_string(),
            name: id.to_string(),
            kind: "service".to_string(),
            identifier: id.to_string(),
            version: "1".to_string(),
            metadata: HashMap::from([("region".to_string(), region.to_string())]),
            config: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn deployment() -> Deployment {
        Deployment {
            id: "dep-1".to_string(),
            workspace_id: "ws-1".to_string(),
            system_id: "sys-1".to_string(),
            name: "api".to_string(),
            resource_selector: None,
            job_agent_id: None,
            job_agent_config: serde_json::Value::Null,
        }
    }

    fn literal(v: serde_json::Value) -> VarValue {
        VarValue::Literal { value: v }
    }

    fn declare(store: &Store, key: &str, default: Option<VarValue>) -> DeploymentVariable {
        let var = DeploymentVariable {
            id: format!("var-{key}"),
            deployment_id: "dep-1".to_string(),
            key: key.to_string(),
            default_value: default,
        };
        store.put_deployment_variable(&var).unwrap();
        var
    }

    fn add_value(
        store: &Store,
        var: &DeploymentVariable,
        id: &str,
        selector: Option<&str>,
        priority: i32,
        value: VarValue,
    ) {
        store
            .put_deployment_variable_value(&DeploymentVariableValue {
                id: id.to_string(),
                deployment_variable_id: var.id.clone(),
                resource_selector: selector.map(|s| Selector::Cel(s.to_string())),
                priority,
                value,
            })
            .unwrap();
    }

    #[test]
    fn selector_scoped_value_beats_default() {
        let store = Store::open_in_memory().unwrap();
        let var = declare(
            &store,
            "region_host",
            Some(literal(serde_json::json!("us-west-2"))),
        );
        add_value(
            &store,
            &var,
            "val-1",
            Some("metadata.region == \"us-east-1\""),
            0,
            literal(serde_json::json!("east.example.com")),
        );

        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let east = resolver.resolve(&deployment(), &resource("res-1", "us-east-1")).unwrap();
        assert_eq!(east["region_host"], "east.example.com");

        let other = resolver.resolve(&deployment(), &resource("res-2", "eu-central-1")).unwrap();
        assert_eq!(other["region_host"], "us-west-2");
    }

    #[test]
    fn key_without_candidates_or_default_is_omitted() {
        let store = Store::open_in_memory().unwrap();
        let var = declare(&store, "region_host", None);
        add_value(
            &store,
            &var,
            "val-1",
            Some("metadata.region == \"us-east-1\""),
            0,
            literal(serde_json::json!("east.example.com")),
        );

        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let resolved = resolver.resolve(&deployment(), &resource("res-1", "eu-central-1")).unwrap();
        assert!(!resolved.contains_key("region_host"));
    }

    #[test]
    fn resource_override_wins_over_values() {
        let store = Store::open_in_memory().unwrap();
        let var = declare(&store, "replicas", None);
        add_value(&store, &var, "val-1", None, 10, literal(serde_json::json!(3)));
        store
            .put_resource_variable(&ResourceVariable {
                resource_id: "res-1".to_string(),
                key: "replicas".to_string(),
                value: literal(serde_json::json!(7)),
            })
            .unwrap();

        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let resolved = resolver.resolve(&deployment(), &resource("res-1", "us-east-1")).unwrap();
        assert_eq!(resolved["replicas"], 7);
    }

    #[test]
    fn higher_priority_value_wins() {
        let store = Store::open_in_memory().unwrap();
        let var = declare(&store, "tier", None);
        add_value(&store, &var, "val-low", None, 1, literal(serde_json::json!("standard")));
        add_value(&store, &var, "val-high", None, 5, literal(serde_json::json!("premium")));

        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let resolved = resolver.resolve(&deployment(), &resource("res-1", "us-east-1")).unwrap();
        assert_eq!(resolved["tier"], "premium");
    }

    #[test]
    fn unresolvable_candidate_falls_through() {
        let store = Store::open_in_memory().unwrap();
        let var = declare(&store, "db_host", None);
        add_value(
            &store,
            &var,
            "val-ref",
            None,
            5,
            VarValue::Reference {
                reference: "database".to_string(),
                path: vec!["config".to_string(), "host".to_string()],
            },
        );
        add_value(&store, &var, "val-lit", None, 1, literal(serde_json::json!("fallback.db")));

        // No `ref/database` edge exists, so the reference fails and the
        // lower-priority literal wins.
        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let resolved = resolver.resolve(&deployment(), &resource("res-1", "us-east-1")).unwrap();
        assert_eq!(resolved["db_host"], "fallback.db");
    }

    #[test]
    fn reference_resolves_through_relation() {
        let store = Store::open_in_memory().unwrap();
        let mut api = resource("res-1", "us-east-1");
        api.metadata
            .insert("ref/database".to_string(), "postgres/main-db".to_string());
        let db = Resource {
            id: "res-db".to_string(),
            workspace_id: "ws-1".to_string(),
            name: "main-db".to_string(),
            kind: "postgres".to_string(),
            identifier: "main-db".to_string(),
            version: "1".to_string(),
            metadata: HashMap::new(),
            config: serde_json::json!({"host": "db.internal", "port": 5432}),
            created_at: Utc::now(),
        };
        store.put_resource(&api).unwrap();
        store.put_resource(&db).unwrap();

        let var = declare(&store, "db_host", None);
        add_value(
            &store,
            &var,
            "val-ref",
            None,
            0,
            VarValue::Reference {
                reference: "database".to_string(),
                path: vec!["config".to_string(), "host".to_string()],
            },
        );

        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let resolved = resolver.resolve(&deployment(), &api).unwrap();
        assert_eq!(resolved["db_host"], "db.internal");
    }

    #[test]
    fn reference_to_missing_path_fails_resolution() {
        let store = Store::open_in_memory().unwrap();
        let mut api = resource("res-1", "us-east-1");
        api.metadata
            .insert("ref/database".to_string(), "postgres/main-db".to_string());
        let mut db = resource("res-db", "us-east-1");
        db.kind = "postgres".to_string();
        db.identifier = "main-db".to_string();
        store.put_resource(&api).unwrap();
        store.put_resource(&db).unwrap();

        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let result = resolver.resolve_value(
            &VarValue::Reference {
                reference: "database".to_string(),
                path: vec!["config".to_string(), "host".to_string()],
            },
            &api,
        );
        assert!(matches!(result, Err(VarsError::Unresolvable(_))));
    }

    #[test]
    fn sensitive_value_becomes_marker_in_map() {
        let store = Store::open_in_memory().unwrap();
        let var = declare(&store, "api_token", None);
        add_value(
            &store,
            &var,
            "val-1",
            None,
            0,
            VarValue::Sensitive {
                value_hash: "abc123".to_string(),
            },
        );

        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let resolved = resolver.resolve(&deployment(), &resource("res-1", "us-east-1")).unwrap();
        assert_eq!(resolved["api_token"], sensitive_marker("abc123"));
    }

    #[test]
    fn sensitive_value_errors_when_resolved_directly() {
        let store = Store::open_in_memory().unwrap();
        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let result = resolver.resolve_value(
            &VarValue::Sensitive {
                value_hash: "abc123".to_string(),
            },
            &resource("res-1", "us-east-1"),
        );
        assert!(matches!(
            result,
            Err(VarsError::SensitiveNotResolvable { value_hash }) if value_hash == "abc123"
        ));
    }

    #[test]
    fn property_path_on_related_entity() {
        let store = Store::open_in_memory().unwrap();
        let mut api = resource("res-1", "us-east-1");
        api.metadata
            .insert("ref/cluster".to_string(), "cluster/prod-1".to_string());
        let mut cluster = resource("res-c", "us-east-1");
        cluster.kind = "cluster".to_string();
        cluster.identifier = "prod-1".to_string();
        cluster.name = "prod-cluster".to_string();
        store.put_resource(&api).unwrap();
        store.put_resource(&cluster).unwrap();

        let resolver = VariableResolver::new(&store, StoreRelations::new(&store));
        let value = resolver
            .resolve_value(
                &VarValue::Reference {
                    reference: "cluster".to_string(),
                    path: vec!["name".to_string()],
                },
                &api,
            )
            .unwrap();
        assert_eq!(value, "prod-cluster");
    }
}
