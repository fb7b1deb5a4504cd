//! Planning endpoint: natural language -> validated workflow, without
//! submitting a job.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use conductor_core::planner::PlanOutcome;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::serve_cmd::AppState;

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub prompt: String,
}

/// `POST /api/plan {prompt}`
///
/// The planner itself never fails; the outcome always reports whether
/// the request is executable and why not when it is not.
pub async fn plan_workflow(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(request): Json<PlanRequest>,
) -> Result<Json<PlanOutcome>, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::validation("prompt must not be empty"));
    }
    let outcome = state.planner.plan(&request.prompt).await;
    Ok(Json(outcome))
}
