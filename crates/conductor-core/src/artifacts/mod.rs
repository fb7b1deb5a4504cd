//! Versioned, role-keyed artifact store.
//!
//! Artifacts are append-only: registering over an existing
//! `(job_id, type, role)` key produces a new version chained to its
//! parent, computed under a row lock so the ladder is strictly
//! monotonic. Promotion walks `draft -> approved -> frozen`, writes an
//! audit entry per step, and a frozen key rejects both further promotion
//! and supersession.

pub mod diff;

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use conductor_db::models::{Artifact, ArtifactStatus, ArtifactType};
use conductor_db::queries::artifacts as db;
use conductor_db::queries::audit;

pub use conductor_db::queries::artifacts::NewArtifact;

/// Role labels must be short lowercase identifiers.
pub fn role_is_valid(role: &str) -> bool {
    let mut chars = role.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Artifact store errors, mapped to stable API error kinds.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0} not found")]
    NotFound(Uuid),

    #[error("invalid artifact role {0:?}")]
    InvalidRole(String),

    #[error(
        "a frozen artifact already exists for ({job_id}, {artifact_type}, {role:?}); \
         frozen artifacts may not be superseded"
    )]
    FrozenKey {
        job_id: Uuid,
        artifact_type: ArtifactType,
        role: Option<String>,
    },

    #[error("promotion {from} -> {to} is not allowed")]
    InvalidPromotion {
        from: ArtifactStatus,
        to: ArtifactStatus,
    },

    #[error("artifact {id} changed status concurrently (expected {expected})")]
    Conflict { id: Uuid, expected: ArtifactStatus },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Register a new artifact version reported by a task.
///
/// Looks up the current version for the key under a row lock, supersedes
/// it, and inserts the new row with `version = current + 1`, all in one
/// transaction. Registering over a frozen key is a conflict.
pub async fn register(pool: &PgPool, new: &NewArtifact<'_>) -> Result<Artifact, ArtifactError> {
    if let Some(role) = new.role {
        if !role_is_valid(role) {
            return Err(ArtifactError::InvalidRole(role.to_owned()));
        }
    }

    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;

    if db::has_frozen_for_key(&mut *tx, new.job_id, new.artifact_type, new.role).await? {
        return Err(ArtifactError::FrozenKey {
            job_id: new.job_id,
            artifact_type: new.artifact_type,
            role: new.role.map(str::to_owned),
        });
    }

    let current = db::lock_current_for_key(&mut *tx, new.job_id, new.artifact_type, new.role).await?;

    let (version, parent) = match &current {
        Some(cur) => {
            db::clear_current_flag(&mut *tx, cur.id).await?;
            (cur.version + 1, Some(cur.id))
        }
        None => (1, None),
    };

    let artifact = db::insert_version(&mut *tx, new, version, parent).await?;
    tx.commit().await.map_err(anyhow::Error::from)?;

    tracing::debug!(
        artifact_id = %artifact.id,
        job_id = %artifact.job_id,
        artifact_type = %artifact.artifact_type,
        role = artifact.role.as_deref().unwrap_or(""),
        version = artifact.version,
        "registered artifact version"
    );

    Ok(artifact)
}

/// Promote an artifact one step along `draft -> approved -> frozen`.
///
/// Writes an audit entry with the actor and both statuses in the same
/// transaction. Freezing checks the one-frozen-per-key invariant first;
/// the partial unique index backs it up.
pub async fn promote(
    pool: &PgPool,
    artifact_id: Uuid,
    target: ArtifactStatus,
    actor: &str,
) -> Result<Artifact, ArtifactError> {
    let artifact = db::get_artifact(pool, artifact_id)
        .await?
        .ok_or(ArtifactError::NotFound(artifact_id))?;

    let from = artifact.status;
    let allowed = matches!(
        (from, target),
        (ArtifactStatus::Draft, ArtifactStatus::Approved)
            | (ArtifactStatus::Approved, ArtifactStatus::Frozen)
    );
    if !allowed {
        return Err(ArtifactError::InvalidPromotion { from, to: target });
    }

    let mut tx = pool.begin().await.map_err(anyhow::Error::from)?;

    if target == ArtifactStatus::Frozen
        && db::has_frozen_for_key(
            &mut *tx,
            artifact.job_id,
            artifact.artifact_type,
            artifact.role.as_deref(),
        )
        .await?
    {
        return Err(ArtifactError::FrozenKey {
            job_id: artifact.job_id,
            artifact_type: artifact.artifact_type,
            role: artifact.role.clone(),
        });
    }

    let rows = db::transition_artifact_status(&mut *tx, artifact_id, from, target).await?;
    if rows == 0 {
        return Err(ArtifactError::Conflict {
            id: artifact_id,
            expected: from,
        });
    }

    audit::insert_entry(
        &mut *tx,
        Some(artifact.job_id),
        Some(artifact_id),
        actor,
        "artifact_promoted",
        Some(&from.to_string()),
        Some(&target.to_string()),
    )
    .await?;

    tx.commit().await.map_err(anyhow::Error::from)?;

    let promoted = db::get_artifact(pool, artifact_id)
        .await?
        .ok_or(ArtifactError::NotFound(artifact_id))?;

    tracing::info!(
        artifact_id = %artifact_id,
        actor,
        from = %from,
        to = %target,
        "artifact promoted"
    );

    Ok(promoted)
}

/// List every version for a key, oldest first.
pub async fn versions(
    pool: &PgPool,
    job_id: Uuid,
    artifact_type: ArtifactType,
    role: Option<&str>,
) -> Result<Vec<Artifact>, ArtifactError> {
    Ok(db::list_versions_for_key(pool, job_id, artifact_type, role).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_validation() {
        assert!(role_is_valid("latency_p95"));
        assert!(role_is_valid("throughput"));
        assert!(role_is_valid("a1"));
        assert!(!role_is_valid(""));
        assert!(!role_is_valid("Latency"));
        assert!(!role_is_valid("9lives"));
        assert!(!role_is_valid("has-dash"));
    }
}
