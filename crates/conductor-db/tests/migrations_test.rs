//! Integration tests for schema migrations.
//!
//! Each test creates a unique temporary database inside a shared
//! containerized PostgreSQL instance (via testcontainers), runs
//! migrations, and drops it on completion so tests are fully isolated
//! and idempotent.

use conductor_test_utils::TestDb;

#[tokio::test]
async fn migrations_create_expected_tables() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("listing tables should succeed");

    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
    for expected in [
        "artifacts",
        "audit_log",
        "broker_dead_letters",
        "broker_messages",
        "jobs",
        "org_members",
        "schedules",
        "task_dependencies",
        "task_outputs",
        "task_result_receipts",
        "tasks",
        "workflow_template_versions",
        "workflow_templates",
    ] {
        assert!(names.contains(&expected), "missing table {expected}: {names:?}");
    }

    db.teardown().await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();

    // A second run over an already-migrated database is a no-op.
    conductor_db::pool::run_migrations(
        &pool,
        conductor_db::pool::migrations_dir(),
    )
    .await
    .expect("second migration run should succeed");

    db.teardown().await;
}

#[tokio::test]
async fn status_check_constraints_reject_garbage() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();

    let result = sqlx::query(
        "INSERT INTO jobs (org_id, owner_id, title, status) \
         VALUES (gen_random_uuid(), 'u', 't', 'exploded')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "unknown job status should violate CHECK");

    db.teardown().await;
}
