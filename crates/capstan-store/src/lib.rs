//! capstan-store — redb-backed persistence for Capstan entities.
//!
//! Typed CRUD over the domain model: systems, resources, environments,
//! deployments, versions, releases, variables, policies, approvals,
//! jobs, and verification records. All values are JSON-serialized into
//! redb's `&[u8]` value columns. Supports on-disk and in-memory
//! backends (the latter for testing).

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use store::Store;
