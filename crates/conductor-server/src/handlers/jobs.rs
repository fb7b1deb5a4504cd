//! Job endpoints: submission, inspection, lifecycle control, scheduling.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conductor_core::dag::{WorkflowEdge, WorkflowGraph, WorkflowNode};
use conductor_core::scheduler;
use conductor_db::models::{Job, Schedule, ScheduleType, Task};
use conductor_db::queries::jobs as job_db;
use conductor_db::queries::schedules as schedule_db;
use conductor_db::queries::tasks as task_db;

use crate::auth::{effective_org, ensure_job_read, ensure_job_write, AuthUser};
use crate::error::ApiError;
use crate::serve_cmd::AppState;

// -----------------------------------------------------------------------
// Request / response types
// -----------------------------------------------------------------------

/// One task in a job submission. `agent`/`deps` are accepted as aliases
/// so both the UI shape and the canonical shape parse.
#[derive(Debug, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(alias = "agent")]
    pub agent_type: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default, alias = "deps")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub title: String,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub task_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListScope {
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: Job,
    pub progress: ProgressResponse,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub pending: i64,
    pub queued: i64,
    pub running: i64,
    pub awaiting_review: i64,
    pub success: i64,
    pub failed: i64,
    pub skipped: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl From<task_db::JobProgress> for ProgressResponse {
    fn from(p: task_db::JobProgress) -> Self {
        Self {
            pending: p.pending,
            queued: p.queued,
            running: p.running,
            awaiting_review: p.awaiting_review,
            success: p.success,
            failed: p.failed,
            skipped: p.skipped,
            cancelled: p.cancelled,
            total: p.total,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

// -----------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------

pub fn graph_from_specs(tasks: &[TaskSpec], edges: &[WorkflowEdge]) -> WorkflowGraph {
    WorkflowGraph {
        nodes: tasks
            .iter()
            .map(|t| WorkflowNode {
                id: t.id.clone(),
                agent_type: t.agent_type.clone(),
                inputs: t.inputs.clone(),
                dependencies: t.dependencies.clone(),
            })
            .collect(),
        edges: edges.to_vec(),
    }
}

/// `POST /api/jobs`: validate, persist, and start a job.
pub async fn create_job(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    if request.title.trim().is_empty() {
        return Err(ApiError::validation("title must not be empty"));
    }

    let graph = graph_from_specs(&request.tasks, &request.edges);
    let job = state
        .orchestrator
        .submit_job(
            effective_org(&user),
            &user.user_id,
            &request.title,
            &graph,
            None,
        )
        .await?;
    state.orchestrator.start_job(job.id).await?;

    Ok(Json(CreateJobResponse {
        job_id: job.id,
        task_count: request.tasks.len(),
    }))
}

/// `GET /api/jobs?scope=mine|org`
pub async fn list_jobs(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListScope>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = match query.scope.as_deref() {
        None | Some("mine") => job_db::list_jobs_for_owner(&state.pool, &user.user_id).await?,
        Some("org") => {
            let org = user
                .org_id
                .ok_or_else(|| ApiError::validation("token carries no org for scope=org"))?;
            job_db::list_jobs_for_org(&state.pool, org).await?
        }
        Some(other) => {
            return Err(ApiError::validation(format!(
                "unknown scope {other:?}, expected mine or org"
            )));
        }
    };
    Ok(Json(jobs))
}

/// `GET /api/jobs/:id`
pub async fn get_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job = require_job(&state, id).await?;
    ensure_job_read(&state.pool, &user, &job).await?;
    let progress = task_db::get_job_progress(&state.pool, id).await?;
    Ok(Json(JobDetailResponse {
        job,
        progress: progress.into(),
    }))
}

/// `GET /api/jobs/:id/tasks`
pub async fn list_job_tasks(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let job = require_job(&state, id).await?;
    ensure_job_read(&state.pool, &user, &job).await?;
    Ok(Json(task_db::list_tasks_for_job(&state.pool, id).await?))
}

/// `POST /api/jobs/:id/cancel`
pub async fn cancel_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = require_job(&state, id).await?;
    ensure_job_write(&state.pool, &user, &job).await?;
    state.orchestrator.cancel_job(id).await?;
    Ok(Json(serde_json::json!({"cancelled": true})))
}

/// `POST /api/jobs/:id/pause`
pub async fn pause_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = require_job(&state, id).await?;
    ensure_job_write(&state.pool, &user, &job).await?;
    state.orchestrator.pause_job(id).await?;
    Ok(Json(serde_json::json!({"paused": true})))
}

/// `POST /api/jobs/:id/resume`
pub async fn resume_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = require_job(&state, id).await?;
    ensure_job_write(&state.pool, &user, &job).await?;
    state.orchestrator.resume_job(id).await?;
    Ok(Json(serde_json::json!({"resumed": true})))
}

/// `POST /api/jobs/:id/schedule`: attach or replace the job's schedule.
///
/// The job must still be `queued`; a running or finished job cannot be
/// put on a schedule.
pub async fn schedule_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<Schedule>, ApiError> {
    let job = require_job(&state, id).await?;
    ensure_job_write(&state.pool, &user, &job).await?;

    if job.status != conductor_db::models::JobStatus::Queued {
        return Err(ApiError::conflict(format!(
            "job {id} has status {}, only queued jobs can be scheduled",
            job.status
        )));
    }

    match request.schedule_type {
        ScheduleType::Cron => {
            let expr = request
                .cron_expr
                .as_deref()
                .ok_or_else(|| ApiError::validation("cron schedules require cron_expr"))?;
            if scheduler::next_cron_occurrence(expr, Utc::now()).is_none() {
                return Err(ApiError::validation(format!(
                    "invalid cron expression {expr:?}"
                )));
            }
        }
        ScheduleType::Delayed => {
            if request.run_at.is_none() {
                return Err(ApiError::validation("delayed schedules require run_at"));
            }
        }
        ScheduleType::Once => {}
    }

    let next = scheduler::initial_next_run(
        request.schedule_type,
        request.cron_expr.as_deref(),
        request.run_at,
        Utc::now(),
    );

    let schedule = schedule_db::upsert_schedule(
        &state.pool,
        id,
        request.schedule_type,
        request.cron_expr.as_deref(),
        request.run_at,
        next,
    )
    .await?;

    Ok(Json(schedule))
}

pub(crate) async fn require_job(state: &AppState, id: Uuid) -> Result<Job, ApiError> {
    job_db::get_job(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))
}
