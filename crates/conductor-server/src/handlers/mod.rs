//! HTTP handlers, one module per resource.

pub mod artifacts;
pub mod dlq;
pub mod events;
pub mod jobs;
pub mod plan;
pub mod tasks;
pub mod workflows;

use axum::Json;

/// Liveness probe; unauthenticated.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
