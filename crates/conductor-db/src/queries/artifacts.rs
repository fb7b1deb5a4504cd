//! Database query functions for the `artifacts` table.
//!
//! Multi-step operations (version supersession, promotion) are composed in
//! `conductor-core`; the functions here are single statements. The ones
//! participating in row-locked transactions take `&mut PgConnection` so the
//! caller controls the transaction boundary.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{Artifact, ArtifactStatus, ArtifactType};

/// Fields for inserting a new artifact version.
#[derive(Debug, Clone)]
pub struct NewArtifact<'a> {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub artifact_type: ArtifactType,
    pub role: Option<&'a str>,
    pub filename: &'a str,
    pub storage_key: &'a str,
    pub mime_type: Option<&'a str>,
    pub metadata: &'a serde_json::Value,
}

/// Fetch an artifact by ID.
pub async fn get_artifact(pool: &PgPool, id: Uuid) -> Result<Option<Artifact>> {
    let artifact = sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch artifact")?;

    Ok(artifact)
}

/// Lock and fetch the current artifact for `(job_id, type, role)`.
///
/// `FOR UPDATE` serializes concurrent version registrations on the same
/// key; the caller must hold a transaction.
pub async fn lock_current_for_key(
    conn: &mut PgConnection,
    job_id: Uuid,
    artifact_type: ArtifactType,
    role: Option<&str>,
) -> Result<Option<Artifact>> {
    let artifact = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts \
         WHERE job_id = $1 AND artifact_type = $2 \
           AND COALESCE(role, '') = COALESCE($3, '') \
           AND is_current \
         FOR UPDATE",
    )
    .bind(job_id)
    .bind(artifact_type)
    .bind(role)
    .fetch_optional(&mut *conn)
    .await
    .context("failed to lock current artifact")?;

    Ok(artifact)
}

/// Whether any frozen artifact exists for `(job_id, type, role)`.
pub async fn has_frozen_for_key(
    conn: &mut PgConnection,
    job_id: Uuid,
    artifact_type: ArtifactType,
    role: Option<&str>,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS( \
             SELECT 1 FROM artifacts \
             WHERE job_id = $1 AND artifact_type = $2 \
               AND COALESCE(role, '') = COALESCE($3, '') \
               AND status = 'frozen')",
    )
    .bind(job_id)
    .bind(artifact_type)
    .bind(role)
    .fetch_one(&mut *conn)
    .await
    .context("failed to check for frozen artifact")?;

    Ok(exists)
}

/// Clear the `is_current` flag on a superseded artifact row.
pub async fn clear_current_flag(conn: &mut PgConnection, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE artifacts SET is_current = FALSE WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("failed to clear is_current flag")?;

    Ok(())
}

/// Insert a new artifact version row.
pub async fn insert_version(
    conn: &mut PgConnection,
    new: &NewArtifact<'_>,
    version: i32,
    parent_artifact_id: Option<Uuid>,
) -> Result<Artifact> {
    let artifact = sqlx::query_as::<_, Artifact>(
        "INSERT INTO artifacts \
             (job_id, task_id, artifact_type, role, filename, storage_key, \
              mime_type, metadata, version, is_current, parent_artifact_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, $10) \
         RETURNING *",
    )
    .bind(new.job_id)
    .bind(new.task_id)
    .bind(new.artifact_type)
    .bind(new.role)
    .bind(new.filename)
    .bind(new.storage_key)
    .bind(new.mime_type)
    .bind(new.metadata)
    .bind(version)
    .bind(parent_artifact_id)
    .fetch_one(&mut *conn)
    .await
    .context("failed to insert artifact version")?;

    Ok(artifact)
}

/// Atomically promote an artifact from one status to another.
///
/// Optimistically locked on the current status; sets `frozen_at` when the
/// target status is `frozen`. Returns rows affected (0 means the status
/// did not match).
pub async fn transition_artifact_status(
    conn: &mut PgConnection,
    id: Uuid,
    from: ArtifactStatus,
    to: ArtifactStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE artifacts \
         SET status = $1, \
             frozen_at = CASE WHEN $1 = 'frozen' THEN now() ELSE frozen_at END \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(&mut *conn)
    .await
    .context("failed to transition artifact status")?;

    Ok(result.rows_affected())
}

/// List every version for `(job_id, type, role)`, oldest first.
pub async fn list_versions_for_key(
    pool: &PgPool,
    job_id: Uuid,
    artifact_type: ArtifactType,
    role: Option<&str>,
) -> Result<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts \
         WHERE job_id = $1 AND artifact_type = $2 \
           AND COALESCE(role, '') = COALESCE($3, '') \
         ORDER BY version ASC",
    )
    .bind(job_id)
    .bind(artifact_type)
    .bind(role)
    .fetch_all(pool)
    .await
    .context("failed to list artifact versions")?;

    Ok(artifacts)
}

/// List all artifacts registered under a job, newest first.
pub async fn list_artifacts_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts WHERE job_id = $1 ORDER BY created_at DESC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list artifacts for job")?;

    Ok(artifacts)
}
