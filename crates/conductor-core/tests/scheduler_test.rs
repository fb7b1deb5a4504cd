//! Integration tests for the scheduler tick: due schedules, retention
//! GC, and stuck-task detection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use conductor_db::models::{JobStatus, ScheduleType, TaskStatus};
use conductor_db::queries::{jobs as job_db, schedules as schedule_db, tasks as task_db};

use conductor_core::broker::PgBroker;
use conductor_core::dag::{WorkflowGraph, WorkflowNode};
use conductor_core::events::EventPublisher;
use conductor_core::orchestrator::{Orchestrator, OrchestratorConfig};
use conductor_core::scheduler::{Scheduler, SchedulerConfig};
use conductor_test_utils::TestDb;

fn node(id: &str, agent: &str, inputs: serde_json::Value, deps: &[&str]) -> WorkflowNode {
    WorkflowNode {
        id: id.to_owned(),
        agent_type: agent.to_owned(),
        inputs: inputs.as_object().cloned().unwrap_or_default(),
        dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
    }
}

fn single_node_graph() -> WorkflowGraph {
    WorkflowGraph {
        nodes: vec![node("s", "scraper", json!({"url": "https://x"}), &[])],
        edges: vec![],
    }
}

fn scheduler_over(pool: &sqlx::PgPool) -> (Scheduler, Orchestrator) {
    let broker = Arc::new(PgBroker::new(pool.clone(), Duration::from_secs(60), 3));
    let orchestrator = Orchestrator::new(
        pool.clone(),
        broker,
        EventPublisher::default(),
        OrchestratorConfig::default(),
    );
    let scheduler = Scheduler::new(
        orchestrator.clone(),
        SchedulerConfig {
            tick: Duration::from_secs(30),
            retention: chrono::Duration::days(7),
            task_timeout: chrono::Duration::minutes(10),
            gc_batch_size: 100,
            max_retries: 3,
        },
    );
    (scheduler, orchestrator)
}

#[tokio::test]
async fn delayed_schedule_starts_the_job_once() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let (scheduler, orchestrator) = scheduler_over(&pool);

    let job = orchestrator
        .submit_job(Uuid::new_v4(), "user-1", "delayed", &single_node_graph(), None)
        .await
        .expect("submit");
    let run_at = Utc::now() - chrono::Duration::seconds(5);
    schedule_db::upsert_schedule(&pool, job.id, ScheduleType::Delayed, None, Some(run_at), Some(run_at))
        .await
        .expect("schedule");

    scheduler.tick(Utc::now()).await;

    let started = job_db::get_job(&pool, job.id).await.expect("query").expect("exists");
    assert_eq!(started.status, JobStatus::Running);
    let schedule = schedule_db::get_schedule(&pool, job.id)
        .await
        .expect("query")
        .expect("exists");
    assert!(!schedule.enabled, "one-shot schedules retire after firing");
    assert!(schedule.last_run_at.is_some());

    // A second tick does not fire again.
    scheduler.tick(Utc::now()).await;

    db.teardown().await;
}

#[tokio::test]
async fn cron_schedule_spawns_a_clone_and_advances() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let (scheduler, orchestrator) = scheduler_over(&pool);

    let job = orchestrator
        .submit_job(Uuid::new_v4(), "user-1", "nightly", &single_node_graph(), None)
        .await
        .expect("submit");
    schedule_db::upsert_schedule(
        &pool,
        job.id,
        ScheduleType::Cron,
        Some("0 3 * * *"),
        None,
        Some(Utc::now() - chrono::Duration::seconds(5)),
    )
    .await
    .expect("schedule");

    let before = Utc::now();
    scheduler.tick(before).await;

    // The prototype job stays queued; a clone is running.
    let prototype = job_db::get_job(&pool, job.id).await.expect("query").expect("exists");
    assert_eq!(prototype.status, JobStatus::Queued);

    let owned = job_db::list_jobs_for_owner(&pool, "user-1").await.expect("list");
    assert_eq!(owned.len(), 2);
    let clone = owned.iter().find(|j| j.id != job.id).expect("clone exists");
    assert_eq!(clone.status, JobStatus::Running);
    assert_eq!(clone.title, "nightly");

    let cloned_tasks = task_db::list_tasks_for_job(&pool, clone.id).await.expect("tasks");
    assert_eq!(cloned_tasks.len(), 1);
    assert_eq!(cloned_tasks[0].status, TaskStatus::Queued);

    let schedule = schedule_db::get_schedule(&pool, job.id)
        .await
        .expect("query")
        .expect("exists");
    assert!(schedule.enabled);
    assert!(schedule.next_run_at.expect("advanced") > before);

    db.teardown().await;
}

#[tokio::test]
async fn retention_gc_purges_expired_jobs_and_is_idempotent() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let (scheduler, orchestrator) = scheduler_over(&pool);

    // An expired SUCCESS job with a task, output, artifact, audit entry,
    // and schedule.
    let expired = orchestrator
        .submit_job(Uuid::new_v4(), "user-1", "old", &single_node_graph(), None)
        .await
        .expect("submit");
    let task = task_db::list_tasks_for_job(&pool, expired.id).await.expect("tasks")[0].clone();
    conductor_db::queries::outputs::upsert_output(&pool, task.id, "text", &json!("x"))
        .await
        .expect("output");
    sqlx::query(
        "INSERT INTO artifacts (job_id, task_id, artifact_type, filename, storage_key) \
         VALUES ($1, $2, 'text', 'f.txt', 'k')",
    )
    .bind(expired.id)
    .bind(task.id)
    .execute(&pool)
    .await
    .expect("artifact");
    sqlx::query("INSERT INTO audit_log (job_id, actor, action) VALUES ($1, 'alice', 'noop')")
        .bind(expired.id)
        .execute(&pool)
        .await
        .expect("audit");
    schedule_db::upsert_schedule(&pool, expired.id, ScheduleType::Once, None, None, None)
        .await
        .expect("schedule");
    sqlx::query(
        "UPDATE jobs SET status = 'success', updated_at = now() - interval '8 days' WHERE id = $1",
    )
    .bind(expired.id)
    .execute(&pool)
    .await
    .expect("age the job");

    // A fresh job that must survive.
    let fresh = orchestrator
        .submit_job(Uuid::new_v4(), "user-1", "fresh", &single_node_graph(), None)
        .await
        .expect("submit fresh");

    scheduler.tick(Utc::now()).await;

    assert!(job_db::get_job(&pool, expired.id).await.expect("query").is_none());
    assert!(task_db::get_task(&pool, task.id).await.expect("query").is_none());
    assert!(
        schedule_db::get_schedule(&pool, expired.id).await.expect("query").is_none()
    );
    let artifact_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE job_id = $1")
            .bind(expired.id)
            .fetch_one(&pool)
            .await
            .expect("count");
    assert_eq!(artifact_count, 0);
    let audit_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE job_id = $1")
        .bind(expired.id)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(audit_count, 0);

    assert!(job_db::get_job(&pool, fresh.id).await.expect("query").is_some());

    // Running GC again yields the same state.
    scheduler.tick(Utc::now()).await;
    assert!(job_db::get_job(&pool, fresh.id).await.expect("query").is_some());

    db.teardown().await;
}

#[tokio::test]
async fn stuck_task_times_out_and_retries_to_success() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let (scheduler, orchestrator) = scheduler_over(&pool);

    let job = orchestrator
        .submit_job(Uuid::new_v4(), "user-1", "stuck", &single_node_graph(), None)
        .await
        .expect("submit");
    orchestrator.start_job(job.id).await.expect("start");

    let task = task_db::list_tasks_for_job(&pool, job.id).await.expect("tasks")[0].clone();
    conductor_core::state::dispatch::start_task(&pool, task.id)
        .await
        .expect("worker picked up");

    // The worker dies: started_at drifts past the timeout.
    sqlx::query("UPDATE tasks SET started_at = now() - interval '20 minutes' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .expect("age the task");

    let mut events = orchestrator.events().subscribe();
    scheduler.tick(Utc::now()).await;

    let task = task_db::get_task(&pool, task.id).await.expect("query").expect("exists");
    assert_eq!(task.status, TaskStatus::Queued, "timeout failure is retryable");
    assert_eq!(task.retry_count, 1);

    // Subscribers see the timeout failure, then the retry.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Some(status) = event.task_status {
            seen.push(status);
        }
    }
    assert!(
        seen.contains(&TaskStatus::Failed),
        "timeout must publish a failed event, saw {seen:?}"
    );
    assert!(seen.contains(&TaskStatus::Queued), "retry publishes queued, saw {seen:?}");

    // The next attempt succeeds.
    let result = conductor_core::broker::WorkerResult {
        task_id: task.id,
        status: conductor_core::broker::ResultStatus::Success,
        attempt: 1,
        outputs: Some([("text".to_owned(), json!("finally"))].into_iter().collect()),
        artifacts: None,
        error: None,
    };
    orchestrator.handle_worker_result(&result).await.expect("handle");

    let task = task_db::get_task(&pool, task.id).await.expect("query").expect("exists");
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(
        job_db::get_job(&pool, job.id).await.expect("query").expect("exists").status,
        JobStatus::Success
    );

    db.teardown().await;
}

#[tokio::test]
async fn stuck_task_without_retry_budget_fails_terminally() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();
    let (scheduler, orchestrator) = scheduler_over(&pool);

    let job = orchestrator
        .submit_job(Uuid::new_v4(), "user-1", "exhausted", &single_node_graph(), None)
        .await
        .expect("submit");
    orchestrator.start_job(job.id).await.expect("start");

    let task = task_db::list_tasks_for_job(&pool, job.id).await.expect("tasks")[0].clone();
    conductor_core::state::dispatch::start_task(&pool, task.id)
        .await
        .expect("picked up");
    sqlx::query(
        "UPDATE tasks SET started_at = now() - interval '20 minutes', retry_count = 3 \
         WHERE id = $1",
    )
    .bind(task.id)
    .execute(&pool)
    .await
    .expect("exhaust retries");

    scheduler.tick(Utc::now()).await;

    let task = task_db::get_task(&pool, task.id).await.expect("query").expect("exists");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap_or("").contains("timeout"));
    assert_eq!(
        job_db::get_job(&pool, job.id).await.expect("query").expect("exists").status,
        JobStatus::Failed
    );

    db.teardown().await;
}

#[tokio::test]
async fn dead_lettered_dispatch_fails_the_task() {
    let db = TestDb::provision().await;
    let pool = db.pool.clone();

    // Redelivery limit of 1: the first nack dead-letters the dispatch.
    let broker = Arc::new(PgBroker::new(pool.clone(), Duration::from_secs(60), 1));
    let orchestrator = Orchestrator::new(
        pool.clone(),
        broker.clone(),
        EventPublisher::default(),
        OrchestratorConfig::default(),
    );
    let scheduler = Scheduler::new(orchestrator.clone(), SchedulerConfig::default());

    let job = orchestrator
        .submit_job(Uuid::new_v4(), "user-1", "doomed dispatch", &single_node_graph(), None)
        .await
        .expect("submit");
    orchestrator.start_job(job.id).await.expect("start");

    use conductor_core::broker::{Broker, NackOutcome};
    let delivery = broker
        .claim("tasks.scraper")
        .await
        .expect("claim")
        .expect("dispatched");
    let outcome = broker
        .nack(delivery.message_id, "worker cannot deserialize payload")
        .await
        .expect("nack");
    assert!(matches!(outcome, NackOutcome::DeadLettered { .. }));

    // The task is still queued until the reconcile pass runs.
    let task = task_db::list_tasks_for_job(&pool, job.id).await.expect("tasks")[0].clone();
    assert_eq!(task.status, TaskStatus::Queued);

    scheduler.tick(Utc::now()).await;

    let task = task_db::get_task(&pool, task.id).await.expect("query").expect("exists");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap_or("").contains("dead-lettered"));
    assert_eq!(
        job_db::get_job(&pool, job.id).await.expect("query").expect("exists").status,
        JobStatus::Failed
    );

    db.teardown().await;
}
