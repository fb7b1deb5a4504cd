use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused" => Ok(Self::Paused),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
    AwaitingReview,
}

impl TaskStatus {
    /// Whether this status admits no further transitions (other than a
    /// manual retry out of `failed`).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::AwaitingReview => "awaiting_review",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            "awaiting_review" => Ok(Self::AwaitingReview),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Verdict recorded by a human or reviewer agent on a task awaiting review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        };
        f.write_str(s)
    }
}

impl FromStr for ReviewDecision {
    type Err = ReviewDecisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(ReviewDecisionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ReviewDecision`] string.
#[derive(Debug, Clone)]
pub struct ReviewDecisionParseError(pub String);

impl fmt::Display for ReviewDecisionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid review decision: {:?}", self.0)
    }
}

impl std::error::Error for ReviewDecisionParseError {}

// ---------------------------------------------------------------------------

/// Kind of payload an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Pdf,
    Image,
    Chart,
    Table,
    Json,
    Text,
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Chart => "chart",
            Self::Table => "table",
            Self::Json => "json",
            Self::Text => "text",
        };
        f.write_str(s)
    }
}

impl FromStr for ArtifactType {
    type Err = ArtifactTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(Self::Pdf),
            "image" => Ok(Self::Image),
            "chart" => Ok(Self::Chart),
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(ArtifactTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ArtifactType`] string.
#[derive(Debug, Clone)]
pub struct ArtifactTypeParseError(pub String);

impl fmt::Display for ArtifactTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid artifact type: {:?}", self.0)
    }
}

impl std::error::Error for ArtifactTypeParseError {}

// ---------------------------------------------------------------------------

/// Promotion state of an artifact version.
///
/// Allowed transitions: `draft -> approved -> frozen`. Frozen artifacts are
/// immutable and may not be superseded under the same role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Draft,
    Approved,
    Frozen,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Frozen => "frozen",
        };
        f.write_str(s)
    }
}

impl FromStr for ArtifactStatus {
    type Err = ArtifactStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "approved" => Ok(Self::Approved),
            "frozen" => Ok(Self::Frozen),
            other => Err(ArtifactStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ArtifactStatus`] string.
#[derive(Debug, Clone)]
pub struct ArtifactStatusParseError(pub String);

impl fmt::Display for ArtifactStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid artifact status: {:?}", self.0)
    }
}

impl std::error::Error for ArtifactStatusParseError {}

// ---------------------------------------------------------------------------

/// How a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Delayed,
    Cron,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Once => "once",
            Self::Delayed => "delayed",
            Self::Cron => "cron",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleType {
    type Err = ScheduleTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Self::Once),
            "delayed" => Ok(Self::Delayed),
            "cron" => Ok(Self::Cron),
            other => Err(ScheduleTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScheduleType`] string.
#[derive(Debug, Clone)]
pub struct ScheduleTypeParseError(pub String);

impl fmt::Display for ScheduleTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule type: {:?}", self.0)
    }
}

impl std::error::Error for ScheduleTypeParseError {}

// ---------------------------------------------------------------------------

/// Role of a user within an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrgRole {
    Member,
    Admin,
    Owner,
}

impl fmt::Display for OrgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        };
        f.write_str(s)
    }
}

impl FromStr for OrgRole {
    type Err = OrgRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Self::Member),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(OrgRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OrgRole`] string.
#[derive(Debug, Clone)]
pub struct OrgRoleParseError(pub String);

impl fmt::Display for OrgRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid org role: {:?}", self.0)
    }
}

impl std::error::Error for OrgRoleParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A job -- one execution of a task DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub org_id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub status: JobStatus,
    /// Template this job was spawned from, immutable after creation.
    pub template_id: Option<Uuid>,
    pub template_version: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task -- one DAG node within a job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Node id unique within the job's DAG, referenced by placeholders.
    pub name: String,
    pub agent_type: String,
    /// Initial inputs as authored; may contain placeholder references.
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub error: Option<String>,
    pub review_score: Option<f64>,
    pub review_decision: Option<ReviewDecision>,
    pub review_feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// A typed output field emitted by a successful task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskOutput {
    pub task_id: Uuid,
    pub field_name: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One version of a role-keyed artifact registered by a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artifact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub artifact_type: ArtifactType,
    /// Semantic label distinguishing artifacts of the same type within a
    /// job. Must match `^[a-z][a-z0-9_]*$` when present.
    pub role: Option<String>,
    pub filename: String,
    pub storage_key: String,
    pub mime_type: Option<String>,
    pub metadata: serde_json::Value,
    /// Monotonic per `(job_id, artifact_type, role)`.
    pub version: i32,
    pub is_current: bool,
    pub parent_artifact_id: Option<Uuid>,
    pub status: ArtifactStatus,
    pub frozen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A schedule attached to a job (at most one per job).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Schedule {
    pub job_id: Uuid,
    pub schedule_type: ScheduleType,
    pub cron_expr: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A named, versioned workflow template.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One immutable version of a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowTemplateVersion {
    pub id: Uuid,
    pub template_id: Uuid,
    pub version: i32,
    /// The workflow definition as submitted (nodes + edges).
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Membership of a user in an organization.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrgMember {
    pub org_id: Uuid,
    pub user_id: String,
    pub role: OrgRole,
    pub created_at: DateTime<Utc>,
}

/// An append-only audit record for promotions and operator actions.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub job_id: Option<Uuid>,
    pub artifact_id: Option<Uuid>,
    pub actor: String,
    pub action: String,
    pub previous_status: Option<String>,
    pub new_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A durable message awaiting delivery on a named queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BrokerMessage {
    pub id: i64,
    pub queue: String,
    pub body: serde_json::Value,
    pub delivery_count: i32,
    pub available_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A message that exhausted its redeliveries and was routed to the DLQ.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub queue: String,
    pub body: serde_json::Value,
    pub task_id: Option<Uuid>,
    pub reason: String,
    pub delivery_count: i32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_display_roundtrip() {
        let variants = [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Paused,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: JobStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn job_status_invalid() {
        let result = "bogus".parse::<JobStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn job_terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Skipped,
            TaskStatus::Cancelled,
            TaskStatus::AwaitingReview,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "nope".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn task_terminal_statuses() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::AwaitingReview.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn artifact_type_display_roundtrip() {
        let variants = [
            ArtifactType::Pdf,
            ArtifactType::Image,
            ArtifactType::Chart,
            ArtifactType::Table,
            ArtifactType::Json,
            ArtifactType::Text,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ArtifactType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn artifact_status_display_roundtrip() {
        let variants = [
            ArtifactStatus::Draft,
            ArtifactStatus::Approved,
            ArtifactStatus::Frozen,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ArtifactStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn schedule_type_display_roundtrip() {
        let variants = [ScheduleType::Once, ScheduleType::Delayed, ScheduleType::Cron];
        for v in &variants {
            let s = v.to_string();
            let parsed: ScheduleType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn org_role_ordering() {
        assert!(OrgRole::Owner > OrgRole::Admin);
        assert!(OrgRole::Admin > OrgRole::Member);
    }

    #[test]
    fn review_decision_roundtrip() {
        for v in [ReviewDecision::Approve, ReviewDecision::Reject] {
            let parsed: ReviewDecision = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }
}
