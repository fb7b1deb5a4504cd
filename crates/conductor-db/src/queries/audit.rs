//! Database query functions for the `audit_log` table.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::AuditEntry;

/// Append an audit entry.
///
/// Takes a connection so promotions can write their audit row inside the
/// same transaction as the status change.
pub async fn insert_entry(
    conn: &mut PgConnection,
    job_id: Option<Uuid>,
    artifact_id: Option<Uuid>,
    actor: &str,
    action: &str,
    previous_status: Option<&str>,
    new_status: Option<&str>,
) -> Result<AuditEntry> {
    let entry = sqlx::query_as::<_, AuditEntry>(
        "INSERT INTO audit_log \
             (job_id, artifact_id, actor, action, previous_status, new_status) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(job_id)
    .bind(artifact_id)
    .bind(actor)
    .bind(action)
    .bind(previous_status)
    .bind(new_status)
    .fetch_one(&mut *conn)
    .await
    .context("failed to insert audit entry")?;

    Ok(entry)
}

/// List audit entries for a job, oldest first.
pub async fn list_entries_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit_log WHERE job_id = $1 ORDER BY id ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list audit entries for job")?;

    Ok(entries)
}

/// List audit entries for an artifact, oldest first.
pub async fn list_entries_for_artifact(pool: &PgPool, artifact_id: Uuid) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit_log WHERE artifact_id = $1 ORDER BY id ASC",
    )
    .bind(artifact_id)
    .fetch_all(pool)
    .await
    .context("failed to list audit entries for artifact")?;

    Ok(entries)
}
