//! Durable Postgres-backed message broker.
//!
//! Task dispatch publishes onto one queue per agent type; workers publish
//! results onto a single reply queue the orchestrator consumes. Delivery
//! is at-least-once: a claimed message holds a lease, an expired lease
//! makes the message claimable again, and a message that exhausts its
//! redeliveries is routed to the dead-letter table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use conductor_db::models::DeadLetter;
use conductor_db::queries::queue as db;

/// Queue carrying worker results back to the orchestrator.
pub const RESULTS_QUEUE: &str = "results";

/// Queue name for a given agent type.
pub fn task_queue(agent_type: &str) -> String {
    format!("tasks.{agent_type}")
}

/// The wire message dispatching one task attempt to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub agent_type: String,
    pub payload: serde_json::Value,
    pub attempt: i32,
}

/// One artifact reported in a worker result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedArtifact {
    #[serde(rename = "type")]
    pub artifact_type: conductor_db::models::ArtifactType,
    #[serde(default)]
    pub role: Option<String>,
    pub filename: String,
    pub storage_key: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Completion status on the worker reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

/// The wire message a worker publishes when an attempt finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_id: Uuid,
    pub status: ResultStatus,
    #[serde(default)]
    pub attempt: i32,
    #[serde(default)]
    pub outputs: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub artifacts: Option<Vec<ReportedArtifact>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A claimed delivery handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: i64,
    pub queue: String,
    pub body: serde_json::Value,
    pub delivery_count: i32,
}

/// Outcome of a negative acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// The message returned to its queue and becomes available at the
    /// contained delay.
    Requeued,
    /// Redeliveries were exhausted; the message moved to the DLQ.
    DeadLettered { dead_letter_id: i64 },
}

/// Broker errors, kept distinct from domain errors so the orchestrator
/// can classify them as transient.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("message {0} not found")]
    MessageNotFound(i64),
}

/// The enqueue/acknowledge contract between the orchestrator and workers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a durable message, immediately available.
    async fn publish(&self, queue: &str, body: &serde_json::Value) -> Result<i64, BrokerError>;

    /// Publish a durable message that becomes available after `delay`.
    async fn publish_delayed(
        &self,
        queue: &str,
        body: &serde_json::Value,
        delay: Duration,
    ) -> Result<i64, BrokerError>;

    /// Claim the next message on `queue`, if one is available.
    async fn claim(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Positive acknowledgment: the delivery is complete.
    async fn ack(&self, message_id: i64) -> Result<(), BrokerError>;

    /// Negative acknowledgment: requeue or dead-letter depending on the
    /// delivery count.
    async fn nack(&self, message_id: i64, reason: &str) -> Result<NackOutcome, BrokerError>;
}

/// Postgres-backed broker implementation.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
    lease: Duration,
    redelivery_limit: i32,
}

impl PgBroker {
    pub fn new(pool: PgPool, lease: Duration, redelivery_limit: i32) -> Self {
        Self {
            pool,
            lease,
            redelivery_limit,
        }
    }

    /// List dead letters for inspection.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, BrokerError> {
        Ok(db::list_dead_letters(&self.pool, limit).await?)
    }

    /// Replay a dead letter: republish its body onto the original queue
    /// and remove the DLQ row.
    pub async fn replay_dead_letter(&self, dead_letter_id: i64) -> Result<i64, BrokerError> {
        let dead = db::get_dead_letter(&self.pool, dead_letter_id)
            .await?
            .ok_or(BrokerError::MessageNotFound(dead_letter_id))?;

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        let message_id: i64 = sqlx::query_scalar(
            "INSERT INTO broker_messages (queue, body) VALUES ($1, $2) RETURNING id",
        )
        .bind(&dead.queue)
        .bind(&dead.body)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| anyhow::Error::from(e).context("failed to republish dead letter"))?;
        db::delete_dead_letter(&mut *tx, dead_letter_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        Ok(message_id)
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, queue: &str, body: &serde_json::Value) -> Result<i64, BrokerError> {
        Ok(db::publish(&self.pool, queue, body).await?)
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        body: &serde_json::Value,
        delay: Duration,
    ) -> Result<i64, BrokerError> {
        let available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO broker_messages (queue, body, available_at) VALUES ($1, $2, $3) \
             RETURNING id",
        )
        .bind(queue)
        .bind(body)
        .bind(available_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::Error::from(e).context("failed to publish delayed message"))?;

        Ok(id)
    }

    async fn claim(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let lease_until = Utc::now()
            + chrono::Duration::from_std(self.lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        let claimed = db::claim_next(&mut *tx, queue, lease_until).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        Ok(claimed.map(|m| Delivery {
            message_id: m.id,
            queue: m.queue,
            body: m.body,
            delivery_count: m.delivery_count,
        }))
    }

    async fn ack(&self, message_id: i64) -> Result<(), BrokerError> {
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        let rows = db::delete_message(&mut *tx, message_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        if rows == 0 {
            return Err(BrokerError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn nack(&self, message_id: i64, reason: &str) -> Result<NackOutcome, BrokerError> {
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;

        let Some(message) = db::get_message_locked(&mut *tx, message_id).await? else {
            return Err(BrokerError::MessageNotFound(message_id));
        };

        let outcome = if message.delivery_count >= self.redelivery_limit {
            let task_id = message
                .body
                .get("task_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            let dead = db::insert_dead_letter(
                &mut *tx,
                &message.queue,
                &message.body,
                task_id,
                reason,
                message.delivery_count,
            )
            .await?;
            db::delete_message(&mut *tx, message_id).await?;
            NackOutcome::DeadLettered {
                dead_letter_id: dead.id,
            }
        } else {
            // Linear redelivery backoff: nth redelivery waits n seconds.
            let delay = chrono::Duration::seconds(message.delivery_count.max(1) as i64);
            db::release_message(&mut *tx, message_id, Utc::now() + delay).await?;
            NackOutcome::Requeued
        };

        tx.commit().await.map_err(anyhow::Error::from)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_naming() {
        assert_eq!(task_queue("scraper"), "tasks.scraper");
        assert_eq!(RESULTS_QUEUE, "results");
    }

    #[test]
    fn task_message_wire_shape() {
        let msg = TaskMessage {
            task_id: Uuid::nil(),
            job_id: Uuid::nil(),
            agent_type: "scraper".to_owned(),
            payload: serde_json::json!({"url": "https://x"}),
            attempt: 0,
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["agent_type"], "scraper");
        assert_eq!(wire["attempt"], 0);
        assert!(wire["payload"].is_object());
    }

    #[test]
    fn worker_result_parses_minimal_error() {
        let parsed: WorkerResult = serde_json::from_str(
            r#"{"task_id": "00000000-0000-0000-0000-000000000000",
                "status": "error", "error": "connection reset"}"#,
        )
        .unwrap();
        assert_eq!(parsed.status, ResultStatus::Error);
        assert_eq!(parsed.attempt, 0);
        assert!(parsed.outputs.is_none());
    }
}
