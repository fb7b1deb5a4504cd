//! Dead-letter queue inspection and replay.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use conductor_db::models::DeadLetter;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::serve_cmd::AppState;

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// `GET /api/dlq`
pub async fn list_dead_letters(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<DlqQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let limit = query.limit.clamp(1, 1000);
    let dead = state.orchestrator.broker().dead_letters(limit).await?;
    Ok(Json(dead))
}

/// `POST /api/dlq/:id/replay`: republish the message onto its original
/// queue and drop the DLQ row.
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message_id = state.orchestrator.broker().replay_dead_letter(id).await?;
    Ok(Json(serde_json::json!({"replayed": true, "message_id": message_id})))
}
