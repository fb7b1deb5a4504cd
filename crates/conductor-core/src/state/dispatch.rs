//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::TaskStatus;

use super::TaskStateMachine;

/// Queue a ready task: transition `pending -> queued`.
///
/// The caller is responsible for resolving placeholders and publishing
/// the broker message alongside.
pub async fn queue_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Pending, TaskStatus::Queued, None).await
}

/// Start a task: transition `queued -> running`.
///
/// Sets `started_at` to the current timestamp.
pub async fn start_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Queued, TaskStatus::Running, None).await
}

/// Mark a running task as succeeded.
///
/// Sets `finished_at` to the current timestamp.
pub async fn complete_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Running, TaskStatus::Success, None)
        .await
}

/// Mark a running task as failed with the worker's error.
pub async fn fail_task(pool: &PgPool, task_id: Uuid, error: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Running,
        TaskStatus::Failed,
        Some(error),
    )
    .await
}

/// Park a running reviewer task until a human verdict arrives.
pub async fn await_review(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Running,
        TaskStatus::AwaitingReview,
        None,
    )
    .await
}

/// Approve a task awaiting review: transition to `success`.
pub async fn approve_review(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::AwaitingReview,
        TaskStatus::Success,
        None,
    )
    .await
}

/// Reject a task awaiting review: transition to `failed`.
pub async fn reject_review(pool: &PgPool, task_id: Uuid, feedback: Option<&str>) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::AwaitingReview,
        TaskStatus::Failed,
        feedback,
    )
    .await
}

/// Skip a pending task whose dependency path makes it unrunnable.
pub async fn skip_task(pool: &PgPool, task_id: Uuid, reason: &str) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Pending,
        TaskStatus::Skipped,
        Some(reason),
    )
    .await
}

/// Operator override: force a task to `failed` from any live status.
pub async fn force_fail_task(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    reason: &str,
) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskStatus::Failed, Some(reason)).await
}

/// Retry a failed task: transition `failed -> queued`.
///
/// Increments the retry counter. Fails once `retry_count >= max_retries`.
pub async fn retry_task(pool: &PgPool, task_id: Uuid, max_retries: i32) -> Result<()> {
    TaskStateMachine::retry_transition(pool, task_id, max_retries).await
}
