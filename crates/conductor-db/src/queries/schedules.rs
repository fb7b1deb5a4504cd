//! Database query functions for the `schedules` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Schedule, ScheduleType};

/// Insert or replace the schedule for a job (one schedule per job).
pub async fn upsert_schedule(
    pool: &PgPool,
    job_id: Uuid,
    schedule_type: ScheduleType,
    cron_expr: Option<&str>,
    run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<Schedule> {
    let schedule = sqlx::query_as::<_, Schedule>(
        "INSERT INTO schedules (job_id, schedule_type, cron_expr, run_at, next_run_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (job_id) DO UPDATE \
             SET schedule_type = EXCLUDED.schedule_type, \
                 cron_expr = EXCLUDED.cron_expr, \
                 run_at = EXCLUDED.run_at, \
                 next_run_at = EXCLUDED.next_run_at, \
                 enabled = TRUE \
         RETURNING *",
    )
    .bind(job_id)
    .bind(schedule_type)
    .bind(cron_expr)
    .bind(run_at)
    .bind(next_run_at)
    .fetch_one(pool)
    .await
    .context("failed to upsert schedule")?;

    Ok(schedule)
}

/// Fetch the schedule for a job.
pub async fn get_schedule(pool: &PgPool, job_id: Uuid) -> Result<Option<Schedule>> {
    let schedule = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch schedule")?;

    Ok(schedule)
}

/// Enabled schedules whose `next_run_at` has passed.
pub async fn list_due_schedules(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
    let schedules = sqlx::query_as::<_, Schedule>(
        "SELECT * FROM schedules \
         WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1 \
         ORDER BY next_run_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to list due schedules")?;

    Ok(schedules)
}

/// Advance a schedule after it fired: record `last_run_at` and set the
/// next firing time (NULL plus `enabled = FALSE` retires one-shot types).
pub async fn advance_schedule(
    pool: &PgPool,
    job_id: Uuid,
    fired_at: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE schedules \
         SET last_run_at = $1, \
             next_run_at = $2, \
             enabled = ($2 IS NOT NULL) \
         WHERE job_id = $3",
    )
    .bind(fired_at)
    .bind(next_run_at)
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to advance schedule")?;

    Ok(())
}

/// Enable or disable a schedule.
pub async fn set_schedule_enabled(pool: &PgPool, job_id: Uuid, enabled: bool) -> Result<()> {
    let result = sqlx::query("UPDATE schedules SET enabled = $1 WHERE job_id = $2")
        .bind(enabled)
        .bind(job_id)
        .execute(pool)
        .await
        .context("failed to set schedule enabled")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("schedule for job {job_id} not found");
    }

    Ok(())
}
