//! Router protocol handlers.
//!
//! The wire shapes are fixed: partition lookup returns a bare
//! `{workerId, httpAddress}` object, registration accepts
//! `{workerId, httpAddress, partitions}`.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::registry::WorkerRegistry;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub worker_id: String,
    pub http_address: String,
    pub partitions: Vec<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PartitionOwner {
    worker_id: String,
    http_address: String,
}

fn error_response(message: &str, status: StatusCode) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": message })))
}

/// GET /workers/{id} — the path parameter is a partition number.
pub async fn get_worker_for_partition(
    State(registry): State<WorkerRegistry>,
    Path(partition): Path<i32>,
) -> impl IntoResponse {
    match registry.get_worker_for_partition(partition) {
        Ok(worker) => Json(PartitionOwner {
            worker_id: worker.worker_id,
            http_address: worker.http_address,
        })
        .into_response(),
        Err(e @ (RegistryError::NoWorker(_) | RegistryError::WorkerNotFound(_))) => {
            error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response()
        }
    }
}

/// POST /workers/register
pub async fn register_worker(
    State(registry): State<WorkerRegistry>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    if request.worker_id.is_empty() || request.http_address.is_empty() {
        return error_response(
            "workerId and httpAddress are required",
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    registry.register(&request.worker_id, &request.http_address, &request.partitions);
    StatusCode::OK.into_response()
}

/// POST /workers/{id}/heartbeat — the path parameter is a worker id.
pub async fn worker_heartbeat(
    State(registry): State<WorkerRegistry>,
    Path(worker_id): Path<String>,
) -> impl IntoResponse {
    match registry.heartbeat(&worker_id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /workers
pub async fn list_workers(State(registry): State<WorkerRegistry>) -> impl IntoResponse {
    Json(registry.list_workers())
}
