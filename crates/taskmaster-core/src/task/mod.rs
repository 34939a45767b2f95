//! Task state machine and lifecycle record (§3, §4.8).

pub mod queue;
pub mod table;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::ResourceVector;

/// Lifecycle status of a task. See [`TaskStateMachine`] for the allowed
/// transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<TaskStatus> for taskmaster_db::models::TaskStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => Self::Pending,
            TaskStatus::Queued => Self::Queued,
            TaskStatus::Running => Self::Running,
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<taskmaster_db::models::TaskStatus> for TaskStatus {
    fn from(status: taskmaster_db::models::TaskStatus) -> Self {
        match status {
            taskmaster_db::models::TaskStatus::Pending => Self::Pending,
            taskmaster_db::models::TaskStatus::Queued => Self::Queued,
            taskmaster_db::models::TaskStatus::Running => Self::Running,
            taskmaster_db::models::TaskStatus::Completed => Self::Completed,
            taskmaster_db::models::TaskStatus::Failed => Self::Failed,
            taskmaster_db::models::TaskStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// Why a task failed, surfaced to operators and stored only in logs/events
/// (not a DB column — `status` alone is authoritative per §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ReservationExpired,
    WorkerReported,
}

/// A task's full lifecycle record, owned exclusively by the Task Table
/// (§3: "Cross-component references are by id only").
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: Uuid,
    pub user_id: Option<String>,
    pub docker_image: String,
    pub command: String,
    pub required: ResourceVector,
    pub status: TaskStatus,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub assigned_worker: Option<String>,
    pub load_at_assignment: Option<ResourceVector>,
    /// The live reservation backing this task while RUNNING. Lets the
    /// completion pipeline and reservation sweeper release by id without
    /// a registry-side back-reference to the task (§9).
    pub reservation_id: Option<Uuid>,
    pub sla_met: Option<bool>,
}

impl Task {
    pub fn status_str(&self) -> &'static str {
        self.status.as_str()
    }
}

/// Validates and applies transitions across the graph in §4.8.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// ```text
    /// pending -> queued
    /// queued  -> running
    /// queued  -> cancelled
    /// running -> completed | failed | cancelled
    /// ```
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Queued)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}
