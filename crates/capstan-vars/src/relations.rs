//! Relation lookup over the resource graph.
//!
//! A resource declares outgoing relations in its metadata with keys of
//! the form `ref/<relation>` whose value is `<kind>/<identifier>` of
//! the related resource in the same workspace. Lookup follows edges of
//! the requested relation transitively in breadth-first order, so a
//! chain `api -> cluster -> cluster` yields the nearest entity first.
//! The graph may contain cycles; a visited set bounds the walk.

use std::collections::{HashSet, VecDeque};

use capstan_core::entities::Resource;
use capstan_store::Store;
use tracing::debug;

use crate::error::VarsResult;

/// Metadata key prefix marking an outgoing relation edge.
pub const REF_PREFIX: &str = "ref/";

/// Source of related entity documents for reference resolution.
pub trait RelationSource {
    /// Entities related to `resource` under `relation`, nearest first.
    /// An empty result means the relation does not resolve.
    fn related(&self, resource: &Resource, relation: &str) -> VarsResult<Vec<serde_json::Value>>;
}

/// Store-backed relation source following `ref/<relation>` edges.
pub struct StoreRelations<'a> {
    store: &'a Store,
}

impl<'a> StoreRelations<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    fn follow_edge(&self, from: &Resource, relation: &str) -> VarsResult<Option<Resource>> {
        let Some(target) = from.metadata.get(&format!("{REF_PREFIX}{relation}")) else {
            return Ok(None);
        };
        let Some((kind, identifier)) = target.split_once('/') else {
            debug!(resource = %from.id, relation, target, "malformed relation edge");
            return Ok(None);
        };
        Ok(self.store.find_resource(&from.workspace_id, kind, identifier)?)
    }
}

impl RelationSource for StoreRelations<'_> {
    fn related(&self, resource: &Resource, relation: &str) -> VarsResult<Vec<serde_json::Value>> {
        let mut visited: HashSet<String> = HashSet::from([resource.id.clone()]);
        let mut frontier: VecDeque<Resource> = VecDeque::from([resource.clone()]);
        let mut found = Vec::new();

        while let Some(current) = frontier.pop_front() {
            if let Some(next) = self.follow_edge(&current, relation)? {
                if visited.insert(next.id.clone()) {
                    found.push(relation_doc(&next));
                    frontier.push_back(next);
                }
            }
        }
        Ok(found)
    }
}

/// Document view of a related resource. Extends the selector document
/// with `createdAt`, which reference paths may address.
pub fn relation_doc(resource: &Resource) -> serde_json::Value {
    let mut doc = resource.selector_doc();
    if let Some(map) = doc.as_object_mut() {
        map.insert(
            "createdAt".to_string(),
            serde_json::Value::String(resource.created_at.to_rfc3339()),
        );
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn resource(id: &str, identifier: &str, metadata: &[(&str, &str)]) -> Resource {
        Resource {
            id: id.to_string(),
            workspace_id: "ws-1".to_string(),
            name: identifier.to_string(),
            kind: "service".to_string(),
            identifier: identifier.to_string(),
            version: "1".to_string(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            config: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn follows_a_relation_edge() {
        let store = Store::open_in_memory().unwrap();
        let api = resource("res-a", "api", &[("ref/cluster", "service/cluster-1")]);
        let cluster = resource("res-b", "cluster-1", &[("region", "us-east-1")]);
        store.put_resource(&api).unwrap();
        store.put_resource(&cluster).unwrap();

        let related = StoreRelations::new(&store).related(&api, "cluster").unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0]["identifier"], "cluster-1");
        assert_eq!(related[0]["metadata"]["region"], "us-east-1");
    }

    #[test]
    fn missing_relation_resolves_empty() {
        let store = Store::open_in_memory().unwrap();
        let api = resource("res-a", "api", &[]);
        store.put_resource(&api).unwrap();

        let related = StoreRelations::new(&store).related(&api, "cluster").unwrap();
        assert!(related.is_empty());
    }

    #[test]
    fn transitive_chain_is_nearest_first() {
        let store = Store::open_in_memory().unwrap();
        let a = resource("res-a", "a", &[("ref/up", "service/b")]);
        let b = resource("res-b", "b", &[("ref/up", "service/c")]);
        let c = resource("res-c", "c", &[]);
        for r in [&a, &b, &c] {
            store.put_resource(r).unwrap();
        }

        let related = StoreRelations::new(&store).related(&a, "up").unwrap();
        let ids: Vec<&str> = related
            .iter()
            .map(|d| d["identifier"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn cyclic_graph_terminates() {
        let store = Store::open_in_memory().unwrap();
        let a = resource("res-a", "a", &[("ref/peer", "service/b")]);
        let b = resource("res-b", "b", &[("ref/peer", "service/a")]);
        store.put_resource(&a).unwrap();
        store.put_resource(&b).unwrap();

        let related = StoreRelations::new(&store).related(&a, "peer").unwrap();
        // b is reached, then b's edge back to a is dropped as visited.
        assert_eq!(related.len(), 1);
        assert_eq!(related[0]["identifier"], "b");
    }

    #[test]
    fn relation_doc_carries_created_at() {
        let r = resource("res-a", "a", &[]);
        let doc = relation_doc(&r);
        assert!(doc["createdAt"].as_str().unwrap().contains('T'));
    }
}
