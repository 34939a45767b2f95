use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task (see the state graph in `taskmaster_core::task`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
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
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
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

/// Outcome reported by a worker when a task finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A registered worker, as durably persisted.
///
/// Mirrors `WORKER_REGISTRY` in the repo's schema.md: capacities and
/// allocation are snapshotted here for crash recovery, but the in-memory
/// registry in `taskmaster-core` is the authoritative source while the
/// process is up.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerRow {
    pub worker_id: String,
    pub address: String,
    pub total_cpu: f64,
    pub total_memory: f64,
    pub total_storage: f64,
    pub total_gpu: f64,
    pub allocated_cpu: f64,
    pub allocated_memory: f64,
    pub allocated_storage: f64,
    pub allocated_gpu: f64,
    pub is_active: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task, as durably persisted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub task_id: Uuid,
    pub user_id: Option<String>,
    pub docker_image: String,
    pub command: String,
    pub cpu_required: f64,
    pub memory_required: f64,
    pub storage_required: f64,
    pub gpu_required: f64,
    pub status: TaskStatus,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub assigned_worker: Option<String>,
    pub sla_met: Option<bool>,
}

/// An assignment record: the fact that a task was dispatched to a worker at
/// a point in time. Write-once, append-only audit trail (§3: tasks are
/// "retained for audit" and never destroyed).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssignmentRow {
    pub ass_id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// A completion result record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResultRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub status: ReportStatus,
    pub logs: String,
    pub completed_at: DateTime<Utc>,
}

/// Filter for listing tasks (§4.3: `List(filter)` over status/user/assigned_worker).
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub user_id: Option<String>,
    pub assigned_worker: Option<String>,
}
