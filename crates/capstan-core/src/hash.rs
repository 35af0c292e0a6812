//! Canonical hashing for stable identifiers.
//!
//! Release ids must be invariant under key reordering and under
//! reissuing the same computation, so values are rendered to a
//! canonical JSON form (sorted keys, normalized numbers) before
//! hashing.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::entities::ReleaseTarget;

/// Render a JSON value in canonical form: object keys sorted, arrays
/// in order, scalars via serde_json's standard formatting.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            let fields: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(v)))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Stable release id from target, version, and resolved variables.
pub fn release_id(
    target: &ReleaseTarget,
    version_id: &str,
    variables: &BTreeMap<String, serde_json::Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.key().as_bytes());
    hasher.update(b"|");
    hasher.update(version_id.as_bytes());
    for (key, value) in variables {
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(canonical_json(value).as_bytes());
    }
    format!("rel-{}", hex::encode(&hasher.finalize()[..16]))
}

/// Deterministic rollout hash for a `(resource, version)` pair. Targets
/// are ranked by this value to derive their rollout position.
pub fn rollout_hash(resource_id: &str, version_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(resource_id.as_bytes());
    hasher.update(version_id.as_bytes());
    hasher.finalize().into()
}
