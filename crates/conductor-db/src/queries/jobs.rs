//! Database query functions for the `jobs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, JobStatus};

/// Insert a new job row. Returns the inserted job with server-generated
/// defaults (id, created_at, status).
pub async fn insert_job(
    pool: &PgPool,
    org_id: Uuid,
    owner_id: &str,
    title: &str,
    template_id: Option<Uuid>,
    template_version: Option<i32>,
) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (org_id, owner_id, title, template_id, template_version) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(org_id)
    .bind(owner_id)
    .bind(title)
    .bind(template_id)
    .bind(template_version)
    .fetch_one(pool)
    .await
    .context("failed to insert job")?;

    Ok(job)
}

/// Fetch a job by its ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List jobs owned by a user, newest first.
pub async fn list_jobs_for_owner(pool: &PgPool, owner_id: &str) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE owner_id = $1 ORDER BY created_at DESC",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await
    .context("failed to list jobs for owner")?;

    Ok(jobs)
}

/// List jobs belonging to an organization, newest first.
pub async fn list_jobs_for_org(pool: &PgPool, org_id: Uuid) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE org_id = $1 ORDER BY created_at DESC",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await
    .context("failed to list jobs for org")?;

    Ok(jobs)
}

/// Update the status of a job unconditionally, bumping `updated_at`.
pub async fn update_job_status(pool: &PgPool, id: Uuid, status: JobStatus) -> Result<()> {
    let result = sqlx::query("UPDATE jobs SET status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update job status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("job {id} not found");
    }

    Ok(())
}

/// Atomically transition a job from one status to another.
///
/// Uses optimistic locking: the UPDATE only applies when the current
/// status matches `from`. Returns the number of rows affected (0 means
/// the status did not match).
pub async fn transition_job_status(
    pool: &PgPool,
    id: Uuid,
    from: JobStatus,
    to: JobStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET status = $1, updated_at = now() \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition job status")?;

    Ok(result.rows_affected())
}

/// IDs of terminal jobs last updated before `cutoff`, oldest first.
///
/// Feeds retention GC; `limit` bounds the batch size per tick.
pub async fn list_expired_job_ids(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM jobs \
         WHERE status IN ('success', 'failed', 'cancelled') AND updated_at < $1 \
         ORDER BY updated_at ASC \
         LIMIT $2",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list expired jobs")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Delete a batch of jobs and everything they own, in one transaction.
///
/// Deletion order matters: outputs, receipts, audit entries, artifacts,
/// dependency edges, tasks, schedules, then the jobs. Every statement
/// references the same captured id set so nothing is orphaned if rows
/// change between statements.
pub async fn purge_jobs(pool: &PgPool, job_ids: &[Uuid]) -> Result<u64> {
    if job_ids.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await.context("failed to begin purge transaction")?;

    sqlx::query(
        "DELETE FROM task_outputs o USING tasks t \
         WHERE o.task_id = t.id AND t.job_id = ANY($1)",
    )
    .bind(job_ids)
    .execute(&mut *tx)
    .await
    .context("failed to purge task outputs")?;

    sqlx::query(
        "DELETE FROM task_result_receipts r USING tasks t \
         WHERE r.task_id = t.id AND t.job_id = ANY($1)",
    )
    .bind(job_ids)
    .execute(&mut *tx)
    .await
    .context("failed to purge result receipts")?;

    sqlx::query("DELETE FROM audit_log WHERE job_id = ANY($1)")
        .bind(job_ids)
        .execute(&mut *tx)
        .await
        .context("failed to purge audit entries")?;

    sqlx::query("DELETE FROM artifacts WHERE job_id = ANY($1)")
        .bind(job_ids)
        .execute(&mut *tx)
        .await
        .context("failed to purge artifacts")?;

    sqlx::query(
        "DELETE FROM task_dependencies d USING tasks t \
         WHERE d.task_id = t.id AND t.job_id = ANY($1)",
    )
    .bind(job_ids)
    .execute(&mut *tx)
    .await
    .context("failed to purge task dependencies")?;

    sqlx::query("DELETE FROM tasks WHERE job_id = ANY($1)")
        .bind(job_ids)
        .execute(&mut *tx)
        .await
        .context("failed to purge tasks")?;

    sqlx::query("DELETE FROM schedules WHERE job_id = ANY($1)")
        .bind(job_ids)
        .execute(&mut *tx)
        .await
        .context("failed to purge schedules")?;

    let result = sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
        .bind(job_ids)
        .execute(&mut *tx)
        .await
        .context("failed to purge jobs")?;

    tx.commit().await.context("failed to commit purge")?;

    Ok(result.rows_affected())
}
