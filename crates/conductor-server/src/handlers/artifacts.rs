//! Artifact endpoints: version listing, diffing, promotion.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use conductor_core::artifacts::{self, diff};
use conductor_db::models::{Artifact, ArtifactStatus, ArtifactType};
use conductor_db::queries::artifacts as artifact_db;

use crate::auth::{ensure_job_read, ensure_job_write, AuthUser};
use crate::error::ApiError;
use crate::handlers::jobs::require_job;
use crate::serve_cmd::AppState;

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    /// Artifact id to diff against; defaults to the parent version.
    #[serde(default)]
    pub to: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub target_status: ArtifactStatus,
}

async fn require_artifact(state: &AppState, id: Uuid) -> Result<Artifact, ApiError> {
    artifact_db::get_artifact(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("artifact {id} not found")))
}

/// `GET /api/artifacts/:id/diff?to=<artifact_id>`
///
/// Diffs this artifact against `to` (or against its parent version when
/// `to` is omitted). Both rows must share `(job_id, type, role)`.
pub async fn diff_artifact(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<diff::ArtifactDiff>, ApiError> {
    let to = require_artifact(&state, id).await?;
    let job = require_job(&state, to.job_id).await?;
    ensure_job_read(&state.pool, &user, &job).await?;

    let from_id = match query.to {
        Some(other) => other,
        None => to.parent_artifact_id.ok_or_else(|| {
            ApiError::validation(format!(
                "artifact {id} is version 1; pass ?to= to pick a comparison target"
            ))
        })?,
    };
    let from = require_artifact(&state, from_id).await?;

    // Orient the diff oldest -> newest regardless of argument order.
    let (from, to) = if from.version <= to.version {
        (from, to)
    } else {
        (to, from)
    };

    Ok(Json(diff::diff(&from, &to)?))
}

/// `POST /api/artifacts/:id/promote {target_status}`
pub async fn promote_artifact(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<PromoteRequest>,
) -> Result<Json<Artifact>, ApiError> {
    let artifact = require_artifact(&state, id).await?;
    let job = require_job(&state, artifact.job_id).await?;
    ensure_job_write(&state.pool, &user, &job).await?;

    let promoted =
        artifacts::promote(&state.pool, id, request.target_status, &user.user_id).await?;
    Ok(Json(promoted))
}

/// `GET /api/artifacts/versions/:job_id/:type`
pub async fn list_versions_untyped_role(
    State(state): State<AppState>,
    user: AuthUser,
    Path((job_id, artifact_type)): Path<(Uuid, String)>,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    versions_response(&state, &user, job_id, &artifact_type, None).await
}

/// `GET /api/artifacts/versions/:job_id/:type/:role`
pub async fn list_versions(
    State(state): State<AppState>,
    user: AuthUser,
    Path((job_id, artifact_type, role)): Path<(Uuid, String, String)>,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    versions_response(&state, &user, job_id, &artifact_type, Some(role)).await
}

async fn versions_response(
    state: &AppState,
    user: &AuthUser,
    job_id: Uuid,
    artifact_type: &str,
    role: Option<String>,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    let job = require_job(state, job_id).await?;
    ensure_job_read(&state.pool, user, &job).await?;

    let artifact_type: ArtifactType = artifact_type
        .parse()
        .map_err(|_| ApiError::validation(format!("unknown artifact type {artifact_type:?}")))?;

    let versions =
        artifacts::versions(&state.pool, job_id, artifact_type, role.as_deref()).await?;
    Ok(Json(versions))
}
