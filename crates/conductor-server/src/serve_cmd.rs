//! The `conductor serve` command: REST API, SSE stream, and background
//! loops (result consumer, scheduler) in one process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use conductor_core::broker::PgBroker;
use conductor_core::config::CoreConfig;
use conductor_core::events::EventPublisher;
use conductor_core::orchestrator::{Orchestrator, OrchestratorConfig};
use conductor_core::planner::Planner;
use conductor_core::scheduler::{Scheduler, SchedulerConfig};

use crate::handlers;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub orchestrator: Orchestrator,
    pub planner: Arc<Planner>,
    pub jwt_secret: String,
}

/// Build the API router over a prepared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/plan", post(handlers::plan::plan_workflow))
        .route(
            "/api/jobs",
            get(handlers::jobs::list_jobs).post(handlers::jobs::create_job),
        )
        .route("/api/jobs/{id}", get(handlers::jobs::get_job))
        .route("/api/jobs/{id}/tasks", get(handlers::jobs::list_job_tasks))
        .route("/api/jobs/{id}/events", get(handlers::events::job_events))
        .route("/api/jobs/{id}/cancel", post(handlers::jobs::cancel_job))
        .route("/api/jobs/{id}/pause", post(handlers::jobs::pause_job))
        .route("/api/jobs/{id}/resume", post(handlers::jobs::resume_job))
        .route("/api/jobs/{id}/schedule", post(handlers::jobs::schedule_job))
        .route("/api/tasks/{id}/retry", post(handlers::tasks::retry_task))
        .route("/api/tasks/{id}/skip", post(handlers::tasks::skip_task))
        .route("/api/tasks/{id}/fail", post(handlers::tasks::fail_task))
        .route("/api/tasks/{id}/review", post(handlers::tasks::review_task))
        .route(
            "/api/workflows",
            get(handlers::workflows::list_templates).post(handlers::workflows::create_template),
        )
        .route(
            "/api/workflows/{id}/versions",
            get(handlers::workflows::list_versions).post(handlers::workflows::create_version),
        )
        .route("/api/workflows/{id}/run", post(handlers::workflows::run_template))
        .route("/api/artifacts/{id}/diff", get(handlers::artifacts::diff_artifact))
        .route(
            "/api/artifacts/{id}/promote",
            post(handlers::artifacts::promote_artifact),
        )
        .route(
            "/api/artifacts/versions/{job_id}/{artifact_type}",
            get(handlers::artifacts::list_versions_untyped_role),
        )
        .route(
            "/api/artifacts/versions/{job_id}/{artifact_type}/{role}",
            get(handlers::artifacts::list_versions),
        )
        .route("/api/dlq", get(handlers::dlq::list_dead_letters))
        .route("/api/dlq/{id}/replay", post(handlers::dlq::replay_dead_letter))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Assemble the full runtime: orchestrator, planner, background loops,
/// and the HTTP listener. Blocks until Ctrl+C.
pub async fn run_serve(pool: PgPool, config: CoreConfig, bind: &str, port: u16) -> Result<()> {
    let events = EventPublisher::default();
    let broker = Arc::new(PgBroker::new(
        pool.clone(),
        config.queue_lease,
        config.redelivery_limit,
    ));
    let orchestrator = Orchestrator::new(
        pool.clone(),
        broker,
        events,
        OrchestratorConfig {
            max_retries: config.max_retries,
            result_poll_interval: Duration::from_millis(500),
        },
    );
    let planner = Arc::new(Planner::from_config(&config));

    let state = AppState {
        pool: pool.clone(),
        orchestrator: orchestrator.clone(),
        planner,
        jwt_secret: config.jwt_secret.clone(),
    };

    let cancel = CancellationToken::new();

    let consumer = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run_result_consumer(cancel).await })
    };

    let scheduler_handle = {
        let scheduler = Scheduler::new(
            orchestrator,
            SchedulerConfig {
                tick: config.scheduler_tick,
                retention: chrono::Duration::days(config.retention_days),
                task_timeout: chrono::Duration::from_std(config.task_timeout)
                    .unwrap_or_else(|_| chrono::Duration::minutes(10)),
                gc_batch_size: 100,
                max_retries: config.max_retries,
            },
        );
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("conductor serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = consumer.await;
    let _ = scheduler_handle.await;
    tracing::info!("conductor serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use conductor_core::broker::PgBroker;
    use conductor_core::events::EventPublisher;
    use conductor_core::orchestrator::{Orchestrator, OrchestratorConfig};
    use conductor_core::planner::Planner;
    use conductor_test_utils::TestDb;

    use super::{build_router, AppState};

    const SECRET: &str = "api-test-secret";

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn app_over(pool: &sqlx::PgPool) -> axum::Router {
        let broker = Arc::new(PgBroker::new(pool.clone(), Duration::from_secs(60), 3));
        let orchestrator = Orchestrator::new(
            pool.clone(),
            broker,
            EventPublisher::default(),
            OrchestratorConfig::default(),
        );
        let state = AppState {
            pool: pool.clone(),
            orchestrator,
            planner: Arc::new(Planner::new(vec![])),
            jwt_secret: SECRET.to_owned(),
        };
        build_router(state)
    }

    fn bearer(user: &str, org: Option<Uuid>) -> String {
        let mut claims = json!({
            "sub": user,
            "email": format!("{user}@example.com"),
            "exp": chrono::Utc::now().timestamp() + 3600,
        });
        if let Some(org) = org {
            claims["orgId"] = json!(org);
        }
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("token encodes");
        format!("Bearer {token}")
    }

    async fn send(
        app: &axum::Router,
        method: &str,
        uri: &str,
        auth: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .expect("request builds"),
            None => builder.body(Body::empty()).expect("request builds"),
        };

        let response = app.clone().oneshot(request).await.expect("handler runs");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .expect("body reads");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn linear_job_body() -> Value {
        json!({
            "title": "scrape and summarize",
            "tasks": [
                {"id": "s", "agent": "scraper", "inputs": {"url": "https://x"}},
                {"id": "sum", "agent": "summarizer",
                 "inputs": {"text": "{{tasks.s.outputs.text}}"}, "deps": ["s"]}
            ]
        })
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_needs_no_auth() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);

        let (status, body) = send(&app, "GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        db.teardown().await;
    }

    #[tokio::test]
    async fn missing_token_is_401_with_auth_kind() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);

        let (status, body) = send(&app, "GET", "/api/jobs", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["kind"], "auth");

        db.teardown().await;
    }

    #[tokio::test]
    async fn invalid_dag_is_400_with_validation_kind() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);
        let auth = bearer("user-1", None);

        let body = json!({
            "title": "bad",
            "tasks": [
                {"id": "sum", "agent": "summarizer",
                 "inputs": {"text": "{{tasks.s.outputs.nonexistent}}"}}
            ]
        });
        let (status, body) = send(&app, "POST", "/api/jobs", Some(&auth), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "validation");
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("nonexistent"),
            "message names the bad output: {body}"
        );

        db.teardown().await;
    }

    #[tokio::test]
    async fn create_then_fetch_job_and_tasks() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);
        let auth = bearer("user-1", None);

        let (status, created) =
            send(&app, "POST", "/api/jobs", Some(&auth), Some(linear_job_body())).await;
        assert_eq!(status, StatusCode::OK, "create failed: {created}");
        assert_eq!(created["taskCount"], 2);
        let job_id = created["jobId"].as_str().expect("job id").to_owned();

        let (status, job) =
            send(&app, "GET", &format!("/api/jobs/{job_id}"), Some(&auth), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "running");
        assert_eq!(job["progress"]["total"], 2);
        assert_eq!(job["progress"]["queued"], 1);
        assert_eq!(job["progress"]["pending"], 1);

        let (status, tasks) = send(
            &app,
            "GET",
            &format!("/api/jobs/{job_id}/tasks"),
            Some(&auth),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tasks.as_array().map(Vec::len), Some(2));

        let (status, listed) = send(&app, "GET", "/api/jobs?scope=mine", Some(&auth), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        db.teardown().await;
    }

    #[tokio::test]
    async fn foreign_user_cannot_read_or_cancel() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);
        let owner = bearer("user-1", None);
        let stranger = bearer("user-2", None);

        let (_, created) =
            send(&app, "POST", "/api/jobs", Some(&owner), Some(linear_job_body())).await;
        let job_id = created["jobId"].as_str().expect("job id").to_owned();

        let (status, body) =
            send(&app, "GET", &format!("/api/jobs/{job_id}"), Some(&stranger), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["kind"], "auth");

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/jobs/{job_id}/cancel"),
            Some(&stranger),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        db.teardown().await;
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);
        let auth = bearer("user-1", None);

        let (status, body) = send(
            &app,
            "GET",
            &format!("/api/jobs/{}", Uuid::new_v4()),
            Some(&auth),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");

        db.teardown().await;
    }

    #[tokio::test]
    async fn cancel_twice_is_conflict() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);
        let auth = bearer("user-1", None);

        let (_, created) =
            send(&app, "POST", "/api/jobs", Some(&auth), Some(linear_job_body())).await;
        let job_id = created["jobId"].as_str().expect("job id").to_owned();

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/jobs/{job_id}/cancel"),
            Some(&auth),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/jobs/{job_id}/cancel"),
            Some(&auth),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "conflict");

        db.teardown().await;
    }

    #[tokio::test]
    async fn workflow_template_roundtrip_and_run() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);
        let org = Uuid::new_v4();
        let auth = bearer("user-1", Some(org));

        let definition = json!({
            "nodes": [
                {"id": "s", "agent_type": "scraper", "inputs": {"url": "https://x"},
                 "dependencies": []}
            ],
            "edges": []
        });
        let (status, template) = send(
            &app,
            "POST",
            "/api/workflows",
            Some(&auth),
            Some(json!({"name": "nightly-scrape", "definition": definition})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "create template: {template}");
        assert_eq!(template["latest_version"], 1);
        let template_id = template["id"].as_str().expect("template id").to_owned();

        let (status, version) = send(
            &app,
            "POST",
            &format!("/api/workflows/{template_id}/versions"),
            Some(&auth),
            Some(json!({"definition": definition})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(version["version"], 2);

        let (status, run) = send(
            &app,
            "POST",
            &format!("/api/workflows/{template_id}/run"),
            Some(&auth),
            Some(json!({"title": "from template"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "run template: {run}");
        assert_eq!(run["templateVersion"], 2);

        let job_id = run["jobId"].as_str().expect("job id").to_owned();
        let (status, job) =
            send(&app, "GET", &format!("/api/jobs/{job_id}"), Some(&auth), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["template_id"], template_id.as_str());
        assert_eq!(job["template_version"], 2);

        db.teardown().await;
    }

    #[tokio::test]
    async fn dlq_starts_empty() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);
        let auth = bearer("user-1", None);

        let (status, body) = send(&app, "GET", "/api/dlq", Some(&auth), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(0));

        db.teardown().await;
    }

    #[tokio::test]
    async fn empty_planner_chain_reports_llm_configuration() {
        let db = TestDb::provision().await;
        let pool = db.pool.clone();
        let app = app_over(&pool);
        let auth = bearer("user-1", None);

        let (status, body) = send(
            &app,
            "POST",
            "/api/plan",
            Some(&auth),
            Some(json!({"prompt": "scrape example.com and summarize it"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["can_execute"], false);
        assert!(
            body["reason"].as_str().unwrap().contains("no LLM provider"),
            "got: {body}"
        );

        db.teardown().await;
    }
}
