//! The orchestrator: drives jobs from submission to a terminal status.
//!
//! Owns every task state transition. Submission persists the validated
//! DAG; the readiness scan queues tasks whose dependencies are settled,
//! resolving placeholders into typed payloads on the way to the broker;
//! the result consumer folds worker replies back into the state machine,
//! persists outputs, registers artifacts, and re-derives the owning job
//! after every transition.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{
    Job, JobStatus, ReviewDecision, Task, TaskStatus,
};
use conductor_db::queries::audit;
use conductor_db::queries::jobs as job_db;
use conductor_db::queries::outputs as output_db;
use conductor_db::queries::tasks as task_db;

use crate::artifacts::{self, NewArtifact};
use crate::broker::{
    task_queue, Broker, BrokerError, NackOutcome, PgBroker, ResultStatus, TaskMessage,
    WorkerResult, RESULTS_QUEUE,
};
use crate::dag::{self, WorkflowGraph};
use crate::events::{EventPublisher, TaskEvent};
use crate::payload::AgentPayload;
use crate::registry;
use crate::retry::{classify_worker_error, task_backoff, ErrorClass};
use crate::state::{dispatch, TaskStateMachine};
use crate::template::{self, OutputMap};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Uniform retry limit across all agents.
    pub max_retries: i32,
    /// Poll interval for the result consumer when the queue is empty.
    pub result_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            result_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Orchestrator errors, translated at the API boundary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("workflow validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// The orchestrator. Cheap to clone; shared by the API layer, the result
/// consumer, and the scheduler.
#[derive(Clone)]
pub struct Orchestrator {
    pool: PgPool,
    broker: Arc<PgBroker>,
    events: EventPublisher,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        broker: Arc<PgBroker>,
        events: EventPublisher,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            broker,
            events,
            config,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn broker(&self) -> &Arc<PgBroker> {
        &self.broker
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    // -------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------

    /// Validate a workflow and persist it as a job with its task DAG.
    ///
    /// The job is created in `queued`; call [`Self::start_job`] to begin
    /// execution (immediate submission does both).
    pub async fn submit_job(
        &self,
        org_id: Uuid,
        owner_id: &str,
        title: &str,
        graph: &WorkflowGraph,
        template: Option<(Uuid, i32)>,
    ) -> Result<Job, OrchestratorError> {
        if let Err(errors) = dag::validate(graph) {
            return Err(OrchestratorError::Validation {
                errors: errors.iter().map(|e| e.to_string()).collect(),
            });
        }

        let (template_id, template_version) = match template {
            Some((id, version)) => (Some(id), Some(version)),
            None => (None, None),
        };

        let job = job_db::insert_job(
            &self.pool,
            org_id,
            owner_id,
            title,
            template_id,
            template_version,
        )
        .await?;

        // Insert tasks first, then edges, resolving node names to row ids.
        let mut ids_by_name: HashMap<&str, Uuid> = HashMap::new();
        for node in &graph.nodes {
            let payload = serde_json::Value::Object(node.inputs.clone());
            let task =
                task_db::insert_task(&self.pool, job.id, &node.id, &node.agent_type, &payload)
                    .await?;
            ids_by_name.insert(node.id.as_str(), task.id);
        }
        for node in &graph.nodes {
            let task_id = ids_by_name[node.id.as_str()];
            for dep in graph.dependencies_of(&node.id) {
                task_db::insert_task_dependency(&self.pool, task_id, ids_by_name[dep]).await?;
            }
        }

        tracing::info!(
            job_id = %job.id,
            org_id = %org_id,
            tasks = graph.nodes.len(),
            "job submitted"
        );

        Ok(job)
    }

    /// Start a queued job: transition to `running` and run the first
    /// readiness scan.
    pub async fn start_job(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let rows =
            job_db::transition_job_status(&self.pool, job_id, JobStatus::Queued, JobStatus::Running)
                .await?;
        if rows == 0 {
            let job = self.require_job(job_id).await?;
            return Err(OrchestratorError::InvalidState(format!(
                "job {job_id} has status {}, expected queued",
                job.status
            )));
        }

        self.events
            .publish(TaskEvent::for_job(job_id, JobStatus::Running));
        self.scan_job(job_id).await
    }

    /// Clone a job's task DAG into a fresh job (used by cron schedules).
    ///
    /// Task payloads are stored pristine (placeholders intact), so the
    /// clone starts from the same template state as the original.
    pub async fn clone_job(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let source = self.require_job(job_id).await?;
        let tasks = task_db::list_tasks_for_job(&self.pool, job_id).await?;

        let clone = job_db::insert_job(
            &self.pool,
            source.org_id,
            &source.owner_id,
            &source.title,
            source.template_id,
            source.template_version,
        )
        .await?;

        let mut ids_by_name: HashMap<String, Uuid> = HashMap::new();
        for task in &tasks {
            let new_task = task_db::insert_task(
                &self.pool,
                clone.id,
                &task.name,
                &task.agent_type,
                &task.payload,
            )
            .await?;
            ids_by_name.insert(task.name.clone(), new_task.id);
        }
        for task in &tasks {
            let deps = task_db::get_dependency_tasks(&self.pool, task.id).await?;
            for dep in deps {
                task_db::insert_task_dependency(
                    &self.pool,
                    ids_by_name[&task.name],
                    ids_by_name[&dep.name],
                )
                .await?;
            }
        }

        Ok(clone)
    }

    // -------------------------------------------------------------------
    // Readiness scan
    // -------------------------------------------------------------------

    /// Compute and queue the set of newly ready tasks for a job.
    ///
    /// Applies the skip policy first: a pending task is skipped when a
    /// dependency failed or was cancelled, or when a skipped dependency's
    /// outputs are referenced by the task's template. Skips cascade until
    /// a fixpoint, then every satisfied pending task is resolved and
    /// enqueued.
    pub async fn scan_job(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let job = self.require_job(job_id).await?;
        if job.status != JobStatus::Running {
            // Paused and terminal jobs enqueue nothing.
            return Ok(());
        }

        loop {
            let mut changed = false;
            let tasks = task_db::list_tasks_for_job(&self.pool, job_id).await?;
            let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();

            for task in tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
                let dep_ids = task_db::get_task_dependencies(&self.pool, task.id).await?;
                let deps: Vec<&Task> = dep_ids.iter().filter_map(|id| by_id.get(id).copied()).collect();

                let skip_reason = if deps
                    .iter()
                    .any(|d| matches!(d.status, TaskStatus::Failed | TaskStatus::Cancelled))
                {
                    Some("dependency failed")
                } else if deps.iter().any(|d| {
                    d.status == TaskStatus::Skipped
                        && template::compile(&task.payload).references_node(&d.name)
                }) {
                    Some("dependency skipped")
                } else {
                    None
                };

                if let Some(reason) = skip_reason {
                    dispatch::skip_task(&self.pool, task.id, reason).await?;
                    self.publish_task_event(task, TaskStatus::Skipped, Some(reason));
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        let ready = task_db::list_satisfied_pending_tasks(&self.pool, job_id).await?;
        for task in ready {
            self.enqueue_task(&task).await?;
        }

        self.derive_job(job_id).await
    }

    /// Resolve a pending task's placeholders and hand it to the broker.
    ///
    /// A resolution or payload-shape failure is a fatal task error: the
    /// dependency invariants of a validated DAG make it unreachable, so
    /// it is reported loudly and the task fails without retry.
    async fn enqueue_task(&self, task: &Task) -> Result<(), OrchestratorError> {
        let outputs = self.collect_outputs(task.job_id).await?;

        let resolved = match template::resolve_payload(&task.payload, &outputs) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(
                    task_id = %task.id,
                    job_id = %task.job_id,
                    error = %err,
                    "placeholder resolution failed for a validated DAG"
                );
                return self.fail_before_dispatch(task, &err.to_string()).await;
            }
        };

        let resolved = match self.inject_reviewer_target(task, resolved).await {
            Ok(value) => value,
            Err(err) => return self.fail_before_dispatch(task, &err.to_string()).await,
        };

        let payload = match AgentPayload::from_resolved(&task.agent_type, resolved) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(
                    task_id = %task.id,
                    error = %err,
                    "resolved payload does not fit the agent input shape"
                );
                return self.fail_before_dispatch(task, &err.to_string()).await;
            }
        };

        dispatch::queue_task(&self.pool, task.id).await?;

        let message = TaskMessage {
            task_id: task.id,
            job_id: task.job_id,
            agent_type: task.agent_type.clone(),
            payload: payload.to_value().map_err(anyhow::Error::from)?,
            attempt: task.retry_count,
        };
        self.broker
            .publish(
                &task_queue(&task.agent_type),
                &serde_json::to_value(&message).map_err(anyhow::Error::from)?,
            )
            .await?;

        self.publish_task_event(task, TaskStatus::Queued, None);
        tracing::debug!(
            task_id = %task.id,
            agent_type = %task.agent_type,
            attempt = task.retry_count,
            "task enqueued"
        );
        Ok(())
    }

    /// All outputs of a job keyed by node name, for the resolver.
    async fn collect_outputs(&self, job_id: Uuid) -> Result<OutputMap, OrchestratorError> {
        let rows = output_db::list_outputs_by_node_name(&self.pool, job_id).await?;
        let mut map = OutputMap::new();
        for (node, field, value) in rows {
            map.entry(node).or_insert_with(BTreeMap::new).insert(field, value);
        }
        Ok(map)
    }

    /// Inject `target_task_id` into a reviewer payload from its single
    /// dependency (validated to be exactly one).
    async fn inject_reviewer_target(
        &self,
        task: &Task,
        resolved: serde_json::Value,
    ) -> Result<serde_json::Value, OrchestratorError> {
        if task.agent_type != registry::REVIEWER_AGENT {
            return Ok(resolved);
        }

        let deps = task_db::get_dependency_tasks(&self.pool, task.id).await?;
        let [target] = deps.as_slice() else {
            return Err(OrchestratorError::InvalidState(format!(
                "reviewer task {} has {} dependencies, expected exactly one",
                task.id,
                deps.len()
            )));
        };

        let mut object = match resolved {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(OrchestratorError::InvalidState(format!(
                    "reviewer payload must be an object, got {other}"
                )));
            }
        };
        object.insert(
            "target_task_id".to_owned(),
            serde_json::Value::String(target.id.to_string()),
        );
        Ok(serde_json::Value::Object(object))
    }

    async fn fail_before_dispatch(
        &self,
        task: &Task,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        dispatch::force_fail_task(&self.pool, task.id, TaskStatus::Pending, error).await?;
        self.publish_task_event(task, TaskStatus::Failed, Some(error));
        self.derive_job(task.job_id).await
    }

    // -------------------------------------------------------------------
    // Worker results
    // -------------------------------------------------------------------

    /// Fold one worker result into the state machine.
    ///
    /// Duplicate deliveries (same task and attempt) and results for
    /// already-terminal tasks are discarded; both are acknowledged
    /// normally by the caller.
    pub async fn handle_worker_result(
        &self,
        result: &WorkerResult,
    ) -> Result<(), OrchestratorError> {
        let Some(task) = task_db::get_task(&self.pool, result.task_id).await? else {
            tracing::warn!(task_id = %result.task_id, "result for unknown task discarded");
            return Ok(());
        };

        // Only live worker attempts feed the state machine; results for
        // terminal tasks (cancelled mid-flight, already finished) and for
        // tasks parked in review are discarded.
        if !matches!(task.status, TaskStatus::Queued | TaskStatus::Running) {
            tracing::debug!(
                task_id = %task.id,
                status = %task.status,
                "result for non-live task discarded"
            );
            return Ok(());
        }

        let first_delivery =
            task_db::insert_result_receipt(&self.pool, task.id, result.attempt).await?;
        if !first_delivery {
            tracing::debug!(
                task_id = %task.id,
                attempt = result.attempt,
                "duplicate result discarded"
            );
            return Ok(());
        }

        // A worker that never claimed through the worker channel may
        // deliver a result while the task is still queued.
        if task.status == TaskStatus::Queued {
            dispatch::start_task(&self.pool, task.id).await?;
        }

        match result.status {
            ResultStatus::Success => self.handle_success(&task, result).await?,
            ResultStatus::Error => self.handle_failure(&task, result).await?,
        }

        self.derive_job(task.job_id).await?;

        // New outputs may unblock downstream tasks.
        self.scan_job(task.job_id).await
    }

    async fn handle_success(
        &self,
        task: &Task,
        result: &WorkerResult,
    ) -> Result<(), OrchestratorError> {
        if let Some(outputs) = &result.outputs {
            for (field, value) in outputs {
                output_db::upsert_output(&self.pool, task.id, field, value).await?;
            }
        }

        if let Some(reported) = &result.artifacts {
            for artifact in reported {
                let metadata = artifact
                    .metadata
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({}));
                let new = NewArtifact {
                    job_id: task.job_id,
                    task_id: task.id,
                    artifact_type: artifact.artifact_type,
                    role: artifact.role.as_deref(),
                    filename: &artifact.filename,
                    storage_key: &artifact.storage_key,
                    mime_type: artifact.mime_type.as_deref(),
                    metadata: &metadata,
                };
                if let Err(err) = artifacts::register(&self.pool, &new).await {
                    tracing::error!(
                        task_id = %task.id,
                        error = %err,
                        "artifact registration failed"
                    );
                    let reason = format!("artifact registration failed: {err}");
                    dispatch::fail_task(&self.pool, task.id, &reason).await?;
                    self.publish_task_event(task, TaskStatus::Failed, Some(&reason));
                    return Ok(());
                }
            }
        }

        if task.agent_type == registry::REVIEWER_AGENT {
            self.record_reviewer_verdict(task, result).await?;
            dispatch::await_review(&self.pool, task.id).await?;
            self.publish_task_event(task, TaskStatus::AwaitingReview, None);
        } else {
            dispatch::complete_task(&self.pool, task.id).await?;
            self.publish_task_event(task, TaskStatus::Success, None);
        }
        Ok(())
    }

    /// Copy the reviewer agent's outputs onto the review columns so the
    /// human verdict UI reads one place.
    async fn record_reviewer_verdict(
        &self,
        task: &Task,
        result: &WorkerResult,
    ) -> Result<(), OrchestratorError> {
        let Some(outputs) = &result.outputs else {
            return Ok(());
        };
        let score = outputs.get("score").and_then(serde_json::Value::as_f64);
        let decision = outputs
            .get("decision")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse::<ReviewDecision>().ok());
        let feedback = outputs.get("feedback").and_then(serde_json::Value::as_str);

        if let Some(decision) = decision {
            task_db::set_task_review(&self.pool, task.id, score, decision, feedback).await?;
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        task: &Task,
        result: &WorkerResult,
    ) -> Result<(), OrchestratorError> {
        let error = result.error.as_deref().unwrap_or("worker reported an error");
        dispatch::fail_task(&self.pool, task.id, error).await?;
        self.publish_task_event(task, TaskStatus::Failed, Some(error));

        let retryable = classify_worker_error(error) == ErrorClass::Retryable;
        if retryable && task.retry_count < self.config.max_retries {
            self.requeue_failed(task).await?;
        }
        Ok(())
    }

    /// Retry a failed task: increment the counter, re-resolve, and
    /// publish the next attempt with exponential backoff.
    async fn requeue_failed(&self, task: &Task) -> Result<(), OrchestratorError> {
        TaskStateMachine::retry_transition(&self.pool, task.id, self.config.max_retries).await?;

        let attempt = task.retry_count + 1;
        let outputs = self.collect_outputs(task.job_id).await?;
        let resolved = template::resolve_payload(&task.payload, &outputs)
            .context("placeholder resolution failed on retry")?;
        let resolved = self.inject_reviewer_target(task, resolved).await?;
        let payload = AgentPayload::from_resolved(&task.agent_type, resolved)
            .map_err(anyhow::Error::from)?;

        let message = TaskMessage {
            task_id: task.id,
            job_id: task.job_id,
            agent_type: task.agent_type.clone(),
            payload: payload.to_value().map_err(anyhow::Error::from)?,
            attempt,
        };
        self.broker
            .publish_delayed(
                &task_queue(&task.agent_type),
                &serde_json::to_value(&message).map_err(anyhow::Error::from)?,
                task_backoff(task.retry_count),
            )
            .await?;

        let requeued = Task {
            retry_count: attempt,
            ..task.clone()
        };
        self.publish_task_event(&requeued, TaskStatus::Queued, None);
        tracing::info!(
            task_id = %task.id,
            attempt,
            "failed task requeued with backoff"
        );
        Ok(())
    }

    /// Mark a task failed because its dispatch message was dead-lettered.
    pub async fn mark_dead_lettered(
        &self,
        task_id: Uuid,
        dead_letter_id: i64,
    ) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let reason = format!("message dead-lettered (dlq id {dead_letter_id})");
        dispatch::force_fail_task(&self.pool, task_id, task.status, &reason).await?;
        self.publish_task_event(&task, TaskStatus::Failed, Some(&reason));
        self.derive_job(task.job_id).await?;
        self.scan_job(task.job_id).await
    }

    /// Long-running consumer for the results queue.
    ///
    /// Claims, handles, and acknowledges worker results until cancelled.
    /// Handling errors nack the message so it redelivers; a poisoned
    /// message eventually dead-letters.
    pub async fn run_result_consumer(&self, cancel: CancellationToken) {
        tracing::info!("result consumer started");
        loop {
            if cancel.is_cancelled() {
                tracing::info!("result consumer stopped");
                return;
            }

            let delivery = match self.broker.claim(RESULTS_QUEUE).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => continue,
                        _ = tokio::time::sleep(self.config.result_poll_interval) => continue,
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to claim from results queue");
                    tokio::time::sleep(self.config.result_poll_interval).await;
                    continue;
                }
            };

            let parsed: Result<WorkerResult, _> = serde_json::from_value(delivery.body.clone());
            let outcome = match parsed {
                Ok(result) => self.handle_worker_result(&result).await.map_err(|e| e.to_string()),
                Err(err) => Err(format!("malformed worker result: {err}")),
            };

            match outcome {
                Ok(()) => {
                    if let Err(err) = self.broker.ack(delivery.message_id).await {
                        tracing::error!(error = %err, "failed to ack result message");
                    }
                }
                Err(reason) => {
                    tracing::warn!(
                        message_id = delivery.message_id,
                        error = %reason,
                        "worker result handling failed, nacking"
                    );
                    match self.broker.nack(delivery.message_id, &reason).await {
                        Ok(NackOutcome::DeadLettered { dead_letter_id }) => {
                            tracing::error!(
                                message_id = delivery.message_id,
                                dead_letter_id,
                                "result message dead-lettered"
                            );
                        }
                        Ok(NackOutcome::Requeued) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "failed to nack result message");
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Job-level derivation and control
    // -------------------------------------------------------------------

    /// Re-evaluate the owning job after a task transition.
    ///
    /// The optimistic transition guard means the terminal job event is
    /// emitted exactly once even with concurrent result deliveries.
    pub async fn derive_job(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let job = self.require_job(job_id).await?;
        if job.status != JobStatus::Running {
            return Ok(());
        }

        let progress = task_db::get_job_progress(&self.pool, job_id).await?;
        if !progress.all_terminal() {
            return Ok(());
        }

        let target = if progress.failed > 0 {
            JobStatus::Failed
        } else if progress.cancelled > 0 {
            JobStatus::Cancelled
        } else {
            JobStatus::Success
        };

        let rows =
            job_db::transition_job_status(&self.pool, job_id, JobStatus::Running, target).await?;
        if rows > 0 {
            self.events.publish(TaskEvent::for_job(job_id, target));
            tracing::info!(job_id = %job_id, status = %target, "job reached terminal status");
        }
        Ok(())
    }

    /// Cancel a job: every non-terminal task transitions to `cancelled`.
    ///
    /// In-flight worker messages for those tasks are accepted later but
    /// discarded by the terminal-status check in the result handler.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let job = self.require_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }

        task_db::cancel_non_terminal_tasks(&self.pool, job_id).await?;
        job_db::update_job_status(&self.pool, job_id, JobStatus::Cancelled).await?;
        self.events
            .publish(TaskEvent::for_job(job_id, JobStatus::Cancelled));
        tracing::info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    /// Pause a running job: no new enqueues; in-flight tasks run to
    /// completion.
    pub async fn pause_job(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let rows =
            job_db::transition_job_status(&self.pool, job_id, JobStatus::Running, JobStatus::Paused)
                .await?;
        if rows == 0 {
            let job = self.require_job(job_id).await?;
            return Err(OrchestratorError::InvalidState(format!(
                "job {job_id} has status {}, expected running",
                job.status
            )));
        }
        self.events
            .publish(TaskEvent::for_job(job_id, JobStatus::Paused));
        Ok(())
    }

    /// Resume a paused job and re-run the readiness scan.
    pub async fn resume_job(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let rows =
            job_db::transition_job_status(&self.pool, job_id, JobStatus::Paused, JobStatus::Running)
                .await?;
        if rows == 0 {
            let job = self.require_job(job_id).await?;
            return Err(OrchestratorError::InvalidState(format!(
                "job {job_id} has status {}, expected paused",
                job.status
            )));
        }
        self.events
            .publish(TaskEvent::for_job(job_id, JobStatus::Running));
        self.scan_job(job_id).await
    }

    // -------------------------------------------------------------------
    // Operator task actions
    // -------------------------------------------------------------------

    /// Operator retry of a failed task. `force` bypasses the retry limit.
    pub async fn retry_task(&self, task_id: Uuid, force: bool) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        let limit = if force { i32::MAX } else { self.config.max_retries };
        TaskStateMachine::retry_transition(&self.pool, task_id, limit).await?;

        // Re-read for the incremented counter, then publish the attempt.
        let task = self.require_task(task_id).await?;
        let outputs = self.collect_outputs(task.job_id).await?;
        let resolved = template::resolve_payload(&task.payload, &outputs)
            .context("placeholder resolution failed on manual retry")?;
        let resolved = self.inject_reviewer_target(&task, resolved).await?;
        let payload = AgentPayload::from_resolved(&task.agent_type, resolved)
            .map_err(anyhow::Error::from)?;
        let message = TaskMessage {
            task_id: task.id,
            job_id: task.job_id,
            agent_type: task.agent_type.clone(),
            payload: payload.to_value().map_err(anyhow::Error::from)?,
            attempt: task.retry_count,
        };
        self.broker
            .publish(
                &task_queue(&task.agent_type),
                &serde_json::to_value(&message).map_err(anyhow::Error::from)?,
            )
            .await?;
        self.publish_task_event(&task, TaskStatus::Queued, None);
        Ok(())
    }

    /// Operator skip of a pending task.
    pub async fn skip_task(&self, task_id: Uuid, actor: &str) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        dispatch::skip_task(&self.pool, task_id, "skipped by operator").await?;

        let mut conn = self.pool.acquire().await.map_err(anyhow::Error::from)?;
        audit::insert_entry(
            &mut *conn,
            Some(task.job_id),
            None,
            actor,
            "task_skipped",
            Some(&TaskStatus::Pending.to_string()),
            Some(&TaskStatus::Skipped.to_string()),
        )
        .await?;

        self.publish_task_event(&task, TaskStatus::Skipped, None);
        self.derive_job(task.job_id).await?;
        self.scan_job(task.job_id).await
    }

    /// Operator force-fail of a live task.
    pub async fn fail_task(
        &self,
        task_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }
        dispatch::force_fail_task(&self.pool, task_id, task.status, reason).await?;

        let mut conn = self.pool.acquire().await.map_err(anyhow::Error::from)?;
        audit::insert_entry(
            &mut *conn,
            Some(task.job_id),
            None,
            actor,
            "task_failed_by_operator",
            Some(&task.status.to_string()),
            Some(&TaskStatus::Failed.to_string()),
        )
        .await?;

        self.publish_task_event(&task, TaskStatus::Failed, Some(reason));
        self.derive_job(task.job_id).await?;
        self.scan_job(task.job_id).await
    }

    /// Record a human verdict on a task awaiting review.
    pub async fn review_task(
        &self,
        task_id: Uuid,
        decision: ReviewDecision,
        score: Option<f64>,
        feedback: Option<&str>,
        actor: &str,
    ) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        if task.status != TaskStatus::AwaitingReview {
            return Err(OrchestratorError::InvalidState(format!(
                "task {task_id} has status {}, expected awaiting_review",
                task.status
            )));
        }

        task_db::set_task_review(&self.pool, task_id, score, decision, feedback).await?;

        let new_status = match decision {
            ReviewDecision::Approve => {
                dispatch::approve_review(&self.pool, task_id).await?;
                TaskStatus::Success
            }
            ReviewDecision::Reject => {
                dispatch::reject_review(&self.pool, task_id, feedback).await?;
                TaskStatus::Failed
            }
        };

        let mut conn = self.pool.acquire().await.map_err(anyhow::Error::from)?;
        audit::insert_entry(
            &mut *conn,
            Some(task.job_id),
            None,
            actor,
            "task_reviewed",
            Some(&TaskStatus::AwaitingReview.to_string()),
            Some(&new_status.to_string()),
        )
        .await?;

        self.publish_task_event(&task, new_status, feedback);
        self.derive_job(task.job_id).await?;
        self.scan_job(task.job_id).await
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    async fn require_job(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        job_db::get_job(&self.pool, job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    async fn require_task(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    /// Emit a task transition onto the push stream. Crate-visible so the
    /// scheduler's timeout path reports through the same channel.
    pub(crate) fn publish_task_event(&self, task: &Task, status: TaskStatus, error: Option<&str>) {
        self.events.publish(TaskEvent::for_task(
            task.job_id,
            task.id,
            &task.name,
            &task.agent_type,
            status,
            task.retry_count,
            error,
        ));
    }
}
