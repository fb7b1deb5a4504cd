//! Database query functions for the `org_members` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{OrgMember, OrgRole};

/// Insert or update a membership row.
pub async fn upsert_member(
    pool: &PgPool,
    org_id: Uuid,
    user_id: &str,
    role: OrgRole,
) -> Result<OrgMember> {
    let member = sqlx::query_as::<_, OrgMember>(
        "INSERT INTO org_members (org_id, user_id, role) VALUES ($1, $2, $3) \
         ON CONFLICT (org_id, user_id) DO UPDATE SET role = EXCLUDED.role \
         RETURNING *",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(role)
    .fetch_one(pool)
    .await
    .context("failed to upsert org member")?;

    Ok(member)
}

/// Fetch a user's membership in an organization.
pub async fn get_member(pool: &PgPool, org_id: Uuid, user_id: &str) -> Result<Option<OrgMember>> {
    let member = sqlx::query_as::<_, OrgMember>(
        "SELECT * FROM org_members WHERE org_id = $1 AND user_id = $2",
    )
    .bind(org_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch org member")?;

    Ok(member)
}

/// List all members of an organization.
pub async fn list_members(pool: &PgPool, org_id: Uuid) -> Result<Vec<OrgMember>> {
    let members = sqlx::query_as::<_, OrgMember>(
        "SELECT * FROM org_members WHERE org_id = $1 ORDER BY created_at ASC",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await
    .context("failed to list org members")?;

    Ok(members)
}
