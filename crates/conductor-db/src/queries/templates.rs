//! Database query functions for workflow templates and their versions.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{WorkflowTemplate, WorkflowTemplateVersion};

/// Insert a new workflow template.
pub async fn insert_template(
    pool: &PgPool,
    org_id: Uuid,
    name: &str,
    description: Option<&str>,
) -> Result<WorkflowTemplate> {
    let template = sqlx::query_as::<_, WorkflowTemplate>(
        "INSERT INTO workflow_templates (org_id, name, description) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(org_id)
    .bind(name)
    .bind(description)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow template")?;

    Ok(template)
}

/// Fetch a template by ID.
pub async fn get_template(pool: &PgPool, id: Uuid) -> Result<Option<WorkflowTemplate>> {
    let template =
        sqlx::query_as::<_, WorkflowTemplate>("SELECT * FROM workflow_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch workflow template")?;

    Ok(template)
}

/// List templates for an organization, newest first.
pub async fn list_templates_for_org(pool: &PgPool, org_id: Uuid) -> Result<Vec<WorkflowTemplate>> {
    let templates = sqlx::query_as::<_, WorkflowTemplate>(
        "SELECT * FROM workflow_templates WHERE org_id = $1 ORDER BY created_at DESC",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow templates")?;

    Ok(templates)
}

/// Insert the next version of a template.
///
/// The version number is computed from the current maximum in the same
/// statement, so concurrent inserts serialize on the unique index.
pub async fn insert_template_version(
    pool: &PgPool,
    template_id: Uuid,
    definition: &serde_json::Value,
) -> Result<WorkflowTemplateVersion> {
    let version = sqlx::query_as::<_, WorkflowTemplateVersion>(
        "INSERT INTO workflow_template_versions (template_id, version, definition) \
         SELECT $1, COALESCE(MAX(version), 0) + 1, $2 \
         FROM workflow_template_versions WHERE template_id = $1 \
         RETURNING *",
    )
    .bind(template_id)
    .bind(definition)
    .fetch_one(pool)
    .await
    .context("failed to insert template version")?;

    Ok(version)
}

/// Fetch one version of a template; `version = None` selects the latest.
pub async fn get_template_version(
    pool: &PgPool,
    template_id: Uuid,
    version: Option<i32>,
) -> Result<Option<WorkflowTemplateVersion>> {
    let row = match version {
        Some(v) => {
            sqlx::query_as::<_, WorkflowTemplateVersion>(
                "SELECT * FROM workflow_template_versions \
                 WHERE template_id = $1 AND version = $2",
            )
            .bind(template_id)
            .bind(v)
            .fetch_optional(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, WorkflowTemplateVersion>(
                "SELECT * FROM workflow_template_versions \
                 WHERE template_id = $1 \
                 ORDER BY version DESC LIMIT 1",
            )
            .bind(template_id)
            .fetch_optional(pool)
            .await
        }
    }
    .context("failed to fetch template version")?;

    Ok(row)
}

/// List all versions of a template, newest first.
pub async fn list_template_versions(
    pool: &PgPool,
    template_id: Uuid,
) -> Result<Vec<WorkflowTemplateVersion>> {
    let versions = sqlx::query_as::<_, WorkflowTemplateVersion>(
        "SELECT * FROM workflow_template_versions \
         WHERE template_id = $1 ORDER BY version DESC",
    )
    .bind(template_id)
    .fetch_all(pool)
    .await
    .context("failed to list template versions")?;

    Ok(versions)
}
