//! capstan-vars — variable and relationship resolution.
//!
//! Turns declared deployment variables into the concrete value map of
//! a release. Values may be literals, references that walk the
//! resource relation graph, or sensitive markers that stay opaque
//! until a downstream decryptor handles them.

pub mod error;
pub mod relations;
pub mod resolver;

pub use error::{VarsError, VarsResult};
pub use relations::{RelationSource, StoreRelations, relation_doc};
pub use resolver::{SENSITIVE_KEY, VariableResolver, sensitive_marker};
