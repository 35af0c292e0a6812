//! capstan-rpc — gRPC surface for release-target computation.
//!
//! Exposes a single stateless RPC: given a set of resources,
//! environments, and deployments, compute the release targets their
//! selectors produce. The same pass the selector-eval controller runs
//! against the store, minus the store.

pub mod server;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("capstan.release");
}

pub use server::{ReleaseTargetServer, compute_targets};
