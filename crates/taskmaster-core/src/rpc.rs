//! Worker RPC contract (§6): the shapes exchanged between the Master and
//! its Workers, and the outbound dispatch stream abstraction.
//!
//! The inbound handlers (`RegisterWorker`, `Heartbeat`, `ReportCompletion`)
//! and the transport that carries [`OutboundMessage`] to a live worker are
//! out of scope here — only the message shapes and the connector seam a
//! transport plugs into.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::ResourceVector;

/// Telemetry reported by a worker on each heartbeat.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub gpu_pct: f64,
    pub running_task_ids: Vec<Uuid>,
    pub ts: DateTime<Utc>,
}

/// Outcome reported by a worker when a task finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Success,
    Failed,
    Cancelled,
}

/// A completion report delivered via the inbound `ReportCompletion` RPC.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub worker_id: String,
    pub task_id: Uuid,
    pub status: ReportStatus,
    pub logs: String,
    pub finished_at: DateTime<Utc>,
}

/// A task dispatch, sent over a worker's outbound stream after a
/// successful `Reserve` (§4.4 step e).
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub task_id: Uuid,
    pub docker_image: String,
    pub command: String,
    pub resources: ResourceVector,
    pub deadline: Option<DateTime<Utc>>,
}

/// Everything the Master can push down a worker's outbound stream.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Dispatch(DispatchTask),
    Cancel { task_id: Uuid },
}

/// The sending half of a worker's outbound dispatch channel. Bounded,
/// single-producer (Dispatcher) / single-consumer (the RPC stream that
/// actually talks to the worker process), per §5.
pub type OutboundSender = mpsc::Sender<OutboundMessage>;

/// Establishes (or re-establishes) the outbound stream to a worker.
///
/// The concrete transport (gRPC, WebSocket, ...) is out of scope; this
/// trait is the seam the Reconnection Monitor and initial registration
/// path call through. A test double can implement it without any network
/// I/O at all.
#[async_trait]
pub trait WorkerConnector: Send + Sync {
    /// Attempt to establish an outbound stream to `address`, returning the
    /// sending half of a channel that feeds it. Implementations should
    /// respect `timeout` and return an error past it.
    async fn connect(
        &self,
        worker_id: &str,
        address: &str,
        capacity: usize,
        timeout: std::time::Duration,
    ) -> anyhow::Result<OutboundSender>;
}

#[cfg(test)]
const _ASSERT_OBJECT_SAFE: Option<Box<dyn WorkerConnector>> = None;
