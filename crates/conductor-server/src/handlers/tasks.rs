//! Operator task actions: retry, skip, fail, review.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use conductor_db::models::{ReviewDecision, Task};
use conductor_db::queries::tasks as task_db;

use crate::auth::{ensure_job_write, AuthUser};
use crate::error::ApiError;
use crate::handlers::jobs::require_job;
use crate::serve_cmd::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    #[serde(default = "default_fail_reason")]
    pub reason: String,
}

fn default_fail_reason() -> String {
    "failed by operator".to_owned()
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

async fn authorize_task(
    state: &AppState,
    user: &AuthUser,
    task_id: Uuid,
) -> Result<Task, ApiError> {
    let task = task_db::get_task(&state.pool, task_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {task_id} not found")))?;
    let job = require_job(state, task.job_id).await?;
    ensure_job_write(&state.pool, user, &job).await?;
    Ok(task)
}

/// `POST /api/tasks/:id/retry`
pub async fn retry_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    request: Option<Json<RetryRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize_task(&state, &user, id).await?;
    let force = request.map(|Json(r)| r.force).unwrap_or(false);
    state
        .orchestrator
        .retry_task(id, force)
        .await
        .map_err(map_invalid_to_conflict)?;
    Ok(Json(serde_json::json!({"retried": true})))
}

/// `POST /api/tasks/:id/skip`
pub async fn skip_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize_task(&state, &user, id).await?;
    state
        .orchestrator
        .skip_task(id, &user.user_id)
        .await
        .map_err(map_invalid_to_conflict)?;
    Ok(Json(serde_json::json!({"skipped": true})))
}

/// `POST /api/tasks/:id/fail`
pub async fn fail_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    request: Option<Json<FailRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize_task(&state, &user, id).await?;
    let reason = request
        .map(|Json(r)| r.reason)
        .unwrap_or_else(default_fail_reason);
    state
        .orchestrator
        .fail_task(id, &user.user_id, &reason)
        .await
        .map_err(map_invalid_to_conflict)?;
    Ok(Json(serde_json::json!({"failed": true})))
}

/// `POST /api/tasks/:id/review`: record a human verdict.
pub async fn review_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize_task(&state, &user, id).await?;
    state
        .orchestrator
        .review_task(
            id,
            request.decision,
            request.score,
            request.feedback.as_deref(),
            &user.user_id,
        )
        .await
        .map_err(map_invalid_to_conflict)?;
    Ok(Json(serde_json::json!({"reviewed": true, "decision": request.decision})))
}

/// Anyhow-wrapped state machine rejections read as conflicts, not 500s.
fn map_invalid_to_conflict(err: conductor_core::orchestrator::OrchestratorError) -> ApiError {
    use conductor_core::orchestrator::OrchestratorError;
    match err {
        OrchestratorError::Storage(inner) => {
            let text = format!("{inner:#}");
            if text.contains("cannot retry") || text.contains("invalid state transition") {
                ApiError::conflict(text)
            } else {
                ApiError::internal(inner)
            }
        }
        other => other.into(),
    }
}
