//! Workflow template endpoints: create, version, list, run.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conductor_core::dag::{self, WorkflowGraph};
use conductor_db::models::{WorkflowTemplate, WorkflowTemplateVersion};
use conductor_db::queries::templates as template_db;

use crate::auth::{effective_org, AuthUser};
use crate::error::ApiError;
use crate::serve_cmd::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Initial workflow definition, stored as version 1.
    pub definition: WorkflowGraph,
}

#[derive(Debug, Serialize)]
pub struct TemplateResponse {
    #[serde(flatten)]
    pub template: WorkflowTemplate,
    pub latest_version: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    pub definition: WorkflowGraph,
}

#[derive(Debug, Deserialize)]
pub struct RunTemplateRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub version: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTemplateResponse {
    pub job_id: Uuid,
    pub template_version: i32,
}

fn validate_definition(definition: &WorkflowGraph) -> Result<(), ApiError> {
    if let Err(errors) = dag::validate(definition) {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ApiError::validation(format!(
            "template definition failed validation: {joined}"
        )));
    }
    Ok(())
}

/// `POST /api/workflows`: create a template with its first version.
pub async fn create_template(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateTemplateRequest>,
) -> Result<Json<TemplateResponse>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::validation("template name must not be empty"));
    }
    validate_definition(&request.definition)?;

    let template = template_db::insert_template(
        &state.pool,
        effective_org(&user),
        &request.name,
        request.description.as_deref(),
    )
    .await?;

    let definition =
        serde_json::to_value(&request.definition).map_err(anyhow::Error::from)?;
    let version =
        template_db::insert_template_version(&state.pool, template.id, &definition).await?;

    Ok(Json(TemplateResponse {
        template,
        latest_version: version.version,
    }))
}

/// `GET /api/workflows`
pub async fn list_templates(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<WorkflowTemplate>>, ApiError> {
    let templates =
        template_db::list_templates_for_org(&state.pool, effective_org(&user)).await?;
    Ok(Json(templates))
}

/// `POST /api/workflows/:id/versions`: append a new immutable version.
pub async fn create_version(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<CreateVersionRequest>,
) -> Result<Json<WorkflowTemplateVersion>, ApiError> {
    require_template_access(&state, &user, id).await?;
    validate_definition(&request.definition)?;

    let definition =
        serde_json::to_value(&request.definition).map_err(anyhow::Error::from)?;
    let version = template_db::insert_template_version(&state.pool, id, &definition).await?;
    Ok(Json(version))
}

/// `GET /api/workflows/:id/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<WorkflowTemplateVersion>>, ApiError> {
    require_template_access(&state, &user, id).await?;
    Ok(Json(template_db::list_template_versions(&state.pool, id).await?))
}

/// `POST /api/workflows/:id/run`: spawn a job from a template version.
pub async fn run_template(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    request: Option<Json<RunTemplateRequest>>,
) -> Result<Json<RunTemplateResponse>, ApiError> {
    let template = require_template_access(&state, &user, id).await?;
    let request = request.map(|Json(r)| r).unwrap_or(RunTemplateRequest {
        title: None,
        version: None,
    });

    let version = template_db::get_template_version(&state.pool, id, request.version)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!(
                "template {id} has no version {:?}",
                request.version
            ))
        })?;

    let graph: WorkflowGraph =
        serde_json::from_value(version.definition.clone()).map_err(|err| {
            ApiError::validation(format!("stored template definition is malformed: {err}"))
        })?;

    let title = request.title.unwrap_or_else(|| template.name.clone());
    let job = state
        .orchestrator
        .submit_job(
            effective_org(&user),
            &user.user_id,
            &title,
            &graph,
            Some((id, version.version)),
        )
        .await?;
    state.orchestrator.start_job(job.id).await?;

    Ok(Json(RunTemplateResponse {
        job_id: job.id,
        template_version: version.version,
    }))
}

async fn require_template_access(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> Result<WorkflowTemplate, ApiError> {
    let template = template_db::get_template(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("template {id} not found")))?;
    if template.org_id != effective_org(user) {
        return Err(ApiError::forbidden("template belongs to another organization"));
    }
    Ok(template)
}
