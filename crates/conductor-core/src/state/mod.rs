//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, timestamp management,
//! and the uniform retry limit.

pub mod dispatch;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::TaskStatus;
use conductor_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending         -> queued | skipped | failed | cancelled
/// queued          -> running | failed | cancelled
/// running         -> success | failed | awaiting_review | cancelled
/// awaiting_review -> success | failed | cancelled
/// failed          -> queued  (retry)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Skipped)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Success)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::AwaitingReview)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::AwaitingReview, TaskStatus::Success)
                | (TaskStatus::AwaitingReview, TaskStatus::Failed)
                | (TaskStatus::AwaitingReview, TaskStatus::Cancelled)
                | (TaskStatus::Failed, TaskStatus::Queued)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// - Validates the transition is legal.
    /// - Sets `started_at` when transitioning `queued -> running`.
    /// - Sets `finished_at` when transitioning to `success`, `failed`,
    ///   `skipped`, or `cancelled`.
    /// - For `failed -> queued` (retry), delegates to
    ///   [`Self::retry_transition`] which also increments the retry
    ///   counter.
    ///
    /// Returns an error if:
    /// - The transition is not valid.
    /// - The current status in the database does not match `from`
    ///   (optimistic lock failure).
    /// - The task does not exist.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                task_id
            );
        }

        // Retry is special: it increments the retry counter.
        if from == TaskStatus::Failed && to == TaskStatus::Queued {
            bail!("retry must go through retry_transition to enforce the retry limit");
        }

        let started_at = if from == TaskStatus::Queued && to == TaskStatus::Running {
            Some(Utc::now())
        } else {
            None
        };

        let finished_at = if to.is_terminal() { Some(Utc::now()) } else { None };

        let rows =
            db::transition_task_status(pool, task_id, from, to, started_at, finished_at, error)
                .await
                .with_context(|| {
                    format!(
                        "failed to transition task {} from {} to {}",
                        task_id, from, to
                    )
                })?;

        if rows == 0 {
            // Either the task does not exist or the status did not match.
            let task = db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {} not found", task_id),
                Some(t) => bail!(
                    "optimistic lock failed: task {} has status {}, expected {}",
                    task_id,
                    t.status,
                    from
                ),
            }
        }

        Ok(())
    }

    /// Handle the `failed -> queued` retry transition.
    ///
    /// Fetches the task to check the retry counter against `max_retries`,
    /// then atomically increments the counter and resets the status.
    pub async fn retry_transition(pool: &PgPool, task_id: Uuid, max_retries: i32) -> Result<()> {
        let task = db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {} not found", task_id))?;

        if task.status != TaskStatus::Failed {
            bail!(
                "cannot retry task {}: current status is {}, expected failed",
                task_id,
                task.status
            );
        }

        if task.retry_count >= max_retries {
            bail!(
                "cannot retry task {}: retry_count {} >= max_retries {}",
                task_id,
                task.retry_count,
                max_retries
            );
        }

        let rows = db::transition_task_retry(pool, task_id, task.retry_count).await?;

        if rows == 0 {
            bail!(
                "optimistic lock failed on retry for task {} (retry_count {})",
                task_id,
                task.retry_count
            );
        }

        Ok(())
    }

    /// Validate that every dependency of a task is in `success` or
    /// `skipped` status.
    pub async fn check_dependencies(pool: &PgPool, task_id: Uuid) -> Result<()> {
        let deps = db::get_dependency_tasks(pool, task_id).await?;

        for dep in deps {
            if !matches!(dep.status, TaskStatus::Success | TaskStatus::Skipped) {
                bail!(
                    "dependency {} ({}) for task {} has status {}, expected success or skipped",
                    dep.name,
                    dep.id,
                    task_id,
                    dep.status
                );
            }
        }

        Ok(())
    }
}
