pub mod completion;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod persistence;
pub mod reconnect;
pub mod registry;
pub mod retry;
pub mod rpc;
pub mod task;
pub mod tau;

pub use config::CoreConfig;
pub use core::{Core, TaskSpec};
pub use error::CoreError;
pub use persistence::{PersistenceAdapter, PostgresPersistence};
pub use registry::{ResourceVector, WorkerRegistry, WorkerView};
pub use rpc::{CompletionReport, DispatchTask, OutboundMessage, ReportStatus, Telemetry, WorkerConnector};
pub use task::{Task, TaskStatus};
pub use task::queue::QueueHealth;
pub use task::table::TaskFilter;
