//! capstan-registry — worker registry and partition router.
//!
//! Workers shard workspace ownership by Kafka partition id. The
//! registry tracks which worker owns which partition, with newest-wins
//! registration and heartbeat-based staleness.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/workers/{id}` | Owning worker for partition `id` |
//! | POST | `/workers/register` | Register a worker and its partitions |
//! | POST | `/workers/{id}/heartbeat` | Refresh worker `id`'s heartbeat |
//! | GET | `/workers` | List healthy workers |
//!
//! The router allows a single parameter name per segment position, so
//! both parameterized routes spell theirs `{id}`: a partition number on
//! the lookup, a worker id on the heartbeat.

pub mod error;
pub mod handlers;
pub mod registry;

use axum::Router;
use axum::routing::{get, post};

pub use error::{RegistryError, RegistryResult};
pub use registry::{WorkerInfo, WorkerRegistry};

/// Build the router protocol endpoints over a registry.
pub fn build_router(registry: WorkerRegistry) -> Router {
    Router::new()
        .route("/workers", get(handlers::list_workers))
        .route("/workers/register", post(handlers::register_worker))
        .route("/workers/{id}/heartbeat", post(handlers::worker_heartbeat))
        .route("/workers/{id}", get(handlers::get_worker_for_partition))
        .with_state(registry)
}
