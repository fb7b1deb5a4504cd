//! Database query functions for the `tasks`, `task_dependencies`, and
//! `task_result_receipts` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{ReviewDecision, Task, TaskStatus};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status, retry_count).
pub async fn insert_task(
    pool: &PgPool,
    job_id: Uuid,
    name: &str,
    agent_type: &str,
    payload: &serde_json::Value,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (job_id, name, agent_type, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(job_id)
    .bind(name)
    .bind(agent_type)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task by its node name within a job.
pub async fn get_task_by_name(pool: &PgPool, job_id: Uuid, name: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE job_id = $1 AND name = $2")
        .bind(job_id)
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task by name")?;

    Ok(task)
}

/// List all tasks for a given job, ordered by creation time.
pub async fn list_tasks_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<Task>> {
    let tasks =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE job_id = $1 ORDER BY created_at ASC")
            .bind(job_id)
            .fetch_all(pool)
            .await
            .context("failed to list tasks for job")?;

    Ok(tasks)
}

/// Insert a dependency edge: `task_id` depends on `depends_on_id`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_task_dependency(
    pool: &PgPool,
    task_id: Uuid,
    depends_on_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on_id)
    .execute(pool)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_task_dependencies(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Fetch the full task rows a given task depends on.
pub async fn get_dependency_tasks(pool: &PgPool, task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT dep.* FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.depends_on \
         WHERE td.task_id = $1 \
         ORDER BY dep.created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get dependency tasks")?;

    Ok(tasks)
}

/// Fetch all tasks that depend on the given task.
pub async fn get_dependent_tasks(pool: &PgPool, task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM task_dependencies td \
         JOIN tasks t ON t.id = td.task_id \
         WHERE td.depends_on = $1 \
         ORDER BY t.created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get dependent tasks")?;

    Ok(tasks)
}

/// Pending tasks of a job whose every dependency has reached `success`
/// or `skipped`.
///
/// This is the readiness scan's candidate set; skip-cascade policy is
/// applied by the caller on top of it.
pub async fn list_satisfied_pending_tasks(pool: &PgPool, job_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.job_id = $1 AND t.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id \
                 AND dep.status NOT IN ('success', 'skipped') \
           ) \
         ORDER BY t.created_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list satisfied pending tasks")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches the expected `from` value. Returns the number of rows
/// affected (0 means the status did not match).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             finished_at = COALESCE($3, finished_at), \
             error = COALESCE($4, error) \
         WHERE id = $5 AND status = $6",
    )
    .bind(to)
    .bind(started_at)
    .bind(finished_at)
    .bind(error)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Retry transition: `failed -> queued`, incrementing `retry_count` and
/// clearing the previous error and timestamps.
///
/// Optimistically locked on both the status and the expected current
/// retry count. Returns rows affected.
pub async fn transition_task_retry(
    pool: &PgPool,
    task_id: Uuid,
    expected_retry_count: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', \
             retry_count = retry_count + 1, \
             error = NULL, \
             started_at = NULL, \
             finished_at = NULL \
         WHERE id = $1 AND status = 'failed' AND retry_count = $2",
    )
    .bind(task_id)
    .bind(expected_retry_count)
    .execute(pool)
    .await
    .context("failed to retry task")?;

    Ok(result.rows_affected())
}

/// Record a reviewer verdict on a task.
pub async fn set_task_review(
    pool: &PgPool,
    task_id: Uuid,
    score: Option<f64>,
    decision: ReviewDecision,
    feedback: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET review_score = $1, review_decision = $2, review_feedback = $3 \
         WHERE id = $4",
    )
    .bind(score)
    .bind(decision)
    .bind(feedback)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set task review")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {task_id} not found");
    }

    Ok(())
}

/// Transition every non-terminal task of a job to `cancelled`.
///
/// Returns the number of tasks cancelled.
pub async fn cancel_non_terminal_tasks(pool: &PgPool, job_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', finished_at = now() \
         WHERE job_id = $1 \
           AND status NOT IN ('success', 'failed', 'skipped', 'cancelled')",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to cancel tasks")?;

    Ok(result.rows_affected())
}

/// Tasks stuck in `running` since before `cutoff`.
pub async fn list_stuck_running_tasks(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'running' AND started_at IS NOT NULL AND started_at < $1 \
         ORDER BY started_at ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stuck running tasks")?;

    Ok(tasks)
}

/// Record a result receipt for `(task_id, attempt)`.
///
/// Returns `true` when this is the first delivery; `false` when a receipt
/// already existed (duplicate delivery, to be discarded).
pub async fn insert_result_receipt(pool: &PgPool, task_id: Uuid, attempt: i32) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO task_result_receipts (task_id, attempt) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(attempt)
    .execute(pool)
    .await
    .context("failed to insert result receipt")?;

    Ok(result.rows_affected() > 0)
}

/// Per-status task counts for a job.
#[derive(Debug, Clone, FromRow)]
pub struct JobProgress {
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

impl JobProgress {
    /// Whether every task has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.pending == 0 && self.queued == 0 && self.running == 0 && self.awaiting_review == 0
    }
}

/// Count tasks per status for a job.
pub async fn get_job_progress(pool: &PgPool, job_id: Uuid) -> Result<JobProgress> {
    let progress = sqlx::query_as::<_, JobProgress>(
        "SELECT \
             COUNT(*) FILTER (WHERE status = 'pending')          AS pending, \
             COUNT(*) FILTER (WHERE status = 'queued')           AS queued, \
             COUNT(*) FILTER (WHERE status = 'running')          AS running, \
             COUNT(*) FILTER (WHERE status = 'awaiting_review')  AS awaiting_review, \
             COUNT(*) FILTER (WHERE status = 'success')          AS success, \
             COUNT(*) FILTER (WHERE status = 'failed')           AS failed, \
             COUNT(*) FILTER (WHERE status = 'skipped')          AS skipped, \
             COUNT(*) FILTER (WHERE status = 'cancelled')        AS cancelled, \
             COUNT(*)                                            AS total \
         FROM tasks WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
    .context("failed to get job progress")?;

    Ok(progress)
}
