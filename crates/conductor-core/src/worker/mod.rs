//! Worker-side channel: the consume half of the broker contract.
//!
//! Remote agent executors claim task messages from their agent-type
//! queue, run, and publish a result onto the results queue. The channel
//! also performs the `queued -> running` transition on claim so the
//! lifecycle reflects pickup, and marks the task failed when a claim is
//! dead-lettered. Integration tests drive the same path to simulate
//! workers.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::queries::tasks as task_db;

use crate::broker::{
    task_queue, Broker, Delivery, NackOutcome, ResultStatus, TaskMessage, WorkerResult,
    RESULTS_QUEUE,
};
use crate::state::dispatch;

/// A task claimed by a worker, pairing the parsed message with its
/// broker delivery for ack/nack.
#[derive(Debug)]
pub struct ClaimedTask {
    pub message: TaskMessage,
    pub delivery: Delivery,
}

/// The worker's view of the broker.
pub struct WorkerChannel<'a, B: Broker + ?Sized> {
    pool: &'a PgPool,
    broker: &'a B,
}

impl<'a, B: Broker + ?Sized> WorkerChannel<'a, B> {
    pub fn new(pool: &'a PgPool, broker: &'a B) -> Self {
        Self { pool, broker }
    }

    /// Claim the next task for an agent type, if any.
    ///
    /// Transitions the task `queued -> running` on first pickup; a
    /// redelivered message for a task already running (lease expiry,
    /// worker crash) is handed over as-is.
    pub async fn claim(&self, agent_type: &str) -> Result<Option<ClaimedTask>> {
        let Some(delivery) = self.broker.claim(&task_queue(agent_type)).await? else {
            return Ok(None);
        };

        let message: TaskMessage = serde_json::from_value(delivery.body.clone())?;

        if let Some(task) = task_db::get_task(self.pool, message.task_id).await? {
            if task.status == conductor_db::models::TaskStatus::Queued {
                dispatch::start_task(self.pool, message.task_id).await?;
            }
        }

        Ok(Some(ClaimedTask { message, delivery }))
    }

    /// Publish a success result and acknowledge the dispatch message.
    pub async fn complete(
        &self,
        claimed: &ClaimedTask,
        outputs: serde_json::Map<String, serde_json::Value>,
        artifacts: Vec<crate::broker::ReportedArtifact>,
    ) -> Result<()> {
        let result = WorkerResult {
            task_id: claimed.message.task_id,
            status: ResultStatus::Success,
            attempt: claimed.message.attempt,
            outputs: Some(outputs),
            artifacts: (!artifacts.is_empty()).then_some(artifacts),
            error: None,
        };
        self.publish_result(&result).await?;
        self.broker.ack(claimed.delivery.message_id).await?;
        Ok(())
    }

    /// Publish an error result and acknowledge the dispatch message.
    pub async fn fail(&self, claimed: &ClaimedTask, error: &str) -> Result<()> {
        let result = WorkerResult {
            task_id: claimed.message.task_id,
            status: ResultStatus::Error,
            attempt: claimed.message.attempt,
            outputs: None,
            artifacts: None,
            error: Some(error.to_owned()),
        };
        self.publish_result(&result).await?;
        self.broker.ack(claimed.delivery.message_id).await?;
        Ok(())
    }

    /// Refuse a claimed task without producing a result. The message
    /// requeues or dead-letters depending on its delivery count; a
    /// dead-lettered dispatch fails the task.
    pub async fn reject(&self, claimed: &ClaimedTask, reason: &str) -> Result<NackOutcome> {
        let outcome = self.broker.nack(claimed.delivery.message_id, reason).await?;
        if let NackOutcome::DeadLettered { dead_letter_id } = outcome {
            tracing::error!(
                task_id = %claimed.message.task_id,
                dead_letter_id,
                "task dispatch dead-lettered"
            );
        }
        Ok(outcome)
    }

    async fn publish_result(&self, result: &WorkerResult) -> Result<()> {
        self.broker
            .publish(RESULTS_QUEUE, &serde_json::to_value(result)?)
            .await?;
        Ok(())
    }
}

/// Convenience used by tests: publish a bare worker result for a task.
pub async fn publish_result<B: Broker + ?Sized>(
    broker: &B,
    task_id: Uuid,
    attempt: i32,
    result: Result<serde_json::Map<String, serde_json::Value>, String>,
) -> Result<()> {
    let message = match result {
        Ok(outputs) => WorkerResult {
            task_id,
            status: ResultStatus::Success,
            attempt,
            outputs: Some(outputs),
            artifacts: None,
            error: None,
        },
        Err(error) => WorkerResult {
            task_id,
            status: ResultStatus::Error,
            attempt,
            outputs: None,
            artifacts: None,
            error: Some(error),
        },
    };
    broker
        .publish(RESULTS_QUEUE, &serde_json::to_value(&message)?)
        .await?;
    Ok(())
}
