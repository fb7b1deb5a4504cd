//! Task event publication.
//!
//! The orchestrator emits a [`TaskEvent`] after every task or job
//! transition. The publisher is an explicit handle threaded through the
//! orchestrator and scheduler; the API layer subscribes and fans events
//! out to SSE clients filtered by job id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use conductor_db::models::{JobStatus, TaskStatus};

/// One progress record on the push stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub job_id: Uuid,
    /// Absent for job-level events.
    pub task_id: Option<Uuid>,
    pub task_name: Option<String>,
    pub agent_type: Option<String>,
    pub task_status: Option<TaskStatus>,
    pub job_status: Option<JobStatus>,
    pub attempt: Option<i32>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn for_task(
        job_id: Uuid,
        task_id: Uuid,
        task_name: &str,
        agent_type: &str,
        status: TaskStatus,
        attempt: i32,
        error: Option<&str>,
    ) -> Self {
        Self {
            job_id,
            task_id: Some(task_id),
            task_name: Some(task_name.to_owned()),
            agent_type: Some(agent_type.to_owned()),
            task_status: Some(status),
            job_status: None,
            attempt: Some(attempt),
            error: error.map(str::to_owned),
            at: Utc::now(),
        }
    }

    pub fn for_job(job_id: Uuid, status: JobStatus) -> Self {
        Self {
            job_id,
            task_id: None,
            task_name: None,
            agent_type: None,
            task_status: None,
            job_status: Some(status),
            attempt: None,
            error: None,
            at: Utc::now(),
        }
    }
}

/// Cloneable publish handle backed by a broadcast channel.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is dropped, and slow subscribers observe `Lagged` on their receiver.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}
