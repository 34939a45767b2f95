//! Error kinds surfaced by the orchestration core (§7).
//!
//! These are the typed, discriminable failures callers branch on —
//! registry/dispatch/completion paths. Persistence and other infra
//! failures propagate as `anyhow::Error` instead, matching the split
//! used throughout this workspace.

use uuid::Uuid;

/// Errors surfaced by the Worker Registry, Task Table, Dispatcher, and
/// Completion Pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("reservation not found: {0}")]
    ReservationNotFound(Uuid),

    #[error("worker {worker_id} already registered at a different address ({existing}, got {requested})")]
    AlreadyExists {
        worker_id: String,
        existing: String,
        requested: String,
    },

    #[error("worker {worker_id} re-registered with smaller capacity than currently allocated")]
    CapacityUnderflow { worker_id: String },

    #[error("insufficient resources on worker {worker_id}")]
    InsufficientResources { worker_id: String },

    #[error("invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: &'static str,
        to: &'static str,
    },

    #[error("stale completion report for task {0}")]
    StaleReport(Uuid),

    #[error("reservation {0} already released")]
    AlreadyReleased(Uuid),

    #[error("task {0} already terminal")]
    AlreadyTerminal(Uuid),

    #[error("worker {worker_id} outbound channel unavailable")]
    Unavailable { worker_id: String },
}
