//! Database query functions for the `task_outputs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskOutput;

/// Insert one output field for a task.
///
/// `(task_id, field_name)` is the primary key; a duplicate delivery of the
/// same field upserts the value so repeated worker results stay idempotent.
pub async fn upsert_output(
    pool: &PgPool,
    task_id: Uuid,
    field_name: &str,
    value: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_outputs (task_id, field_name, value) VALUES ($1, $2, $3) \
         ON CONFLICT (task_id, field_name) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(task_id)
    .bind(field_name)
    .bind(value)
    .execute(pool)
    .await
    .context("failed to upsert task output")?;

    Ok(())
}

/// Fetch a single output field of a task.
pub async fn get_output(
    pool: &PgPool,
    task_id: Uuid,
    field_name: &str,
) -> Result<Option<TaskOutput>> {
    let output = sqlx::query_as::<_, TaskOutput>(
        "SELECT * FROM task_outputs WHERE task_id = $1 AND field_name = $2",
    )
    .bind(task_id)
    .bind(field_name)
    .fetch_optional(pool)
    .await
    .context("failed to fetch task output")?;

    Ok(output)
}

/// List every output field of a task.
pub async fn list_outputs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskOutput>> {
    let outputs = sqlx::query_as::<_, TaskOutput>(
        "SELECT * FROM task_outputs WHERE task_id = $1 ORDER BY field_name ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list task outputs")?;

    Ok(outputs)
}

/// List outputs for every task of a job, keyed by the task's node name.
///
/// The placeholder resolver consumes this: references name tasks by node
/// name, not by row id.
pub async fn list_outputs_by_node_name(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Vec<(String, String, serde_json::Value)>> {
    let rows: Vec<(String, String, serde_json::Value)> = sqlx::query_as(
        "SELECT t.name, o.field_name, o.value \
         FROM task_outputs o \
         JOIN tasks t ON t.id = o.task_id \
         WHERE t.job_id = $1",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list outputs by node name")?;

    Ok(rows)
}
