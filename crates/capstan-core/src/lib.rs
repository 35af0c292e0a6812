//! capstan-core — domain model for the Capstan control plane.
//!
//! Defines the entities a workspace is made of (systems, resources,
//! environments, deployments, versions), the desired-state records the
//! engine produces (release targets, releases, jobs), the policy rule
//! union, and canonical hashing for stable release identifiers.

pub mod entities;
pub mod hash;
pub mod job;
pub mod policy;

pub use entities::*;
pub use hash::{canonical_json, release_id, rollout_hash};
pub use job::*;
pub use policy::*;
