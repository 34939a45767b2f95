//! The `Core` aggregate (§9): composes the Registry, Task Table + Queue,
//! Tau Store, Dispatcher, and Reconnection Monitor into the single
//! process-wide orchestration engine. No ambient globals — everything
//! flows through an instance of this struct, created at startup and torn
//! down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::completion::{self, CompletionResult};
use crate::config::CoreConfig;
use crate::dispatcher::Dispatcher;
use crate::error::CoreError;
use crate::fingerprint;
use crate::persistence::PersistenceAdapter;
use crate::reconnect::ReconnectionMonitor;
use crate::registry::{ResourceVector, WorkerRegistry};
use crate::retry::with_bounded_retry;
use crate::rpc::{CompletionReport, OutboundMessage, Telemetry, WorkerConnector};
use crate::task::queue::TaskQueue;
use crate::task::table::{CancelOutcome, TaskFilter, TaskTable};
use crate::task::{Task, TaskStatus};
use crate::tau::TauStore;

/// The Submission API's task spec (§6). Missing resource fields default
/// to zero.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub docker_image: String,
    pub command: Option<String>,
    pub cpu_required: f64,
    pub memory_required: f64,
    pub storage_required: Option<f64>,
    pub gpu_required: Option<f64>,
    pub user_id: Option<String>,
}

/// The orchestration engine: one instance per Master process.
pub struct Core {
    pub registry: Arc<WorkerRegistry>,
    pub table: Arc<TaskTable>,
    pub queue: Arc<TaskQueue>,
    pub tau_store: Arc<TauStore>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub config: CoreConfig,
    dispatcher: Arc<Dispatcher>,
    reconnect_monitor: Arc<ReconnectionMonitor>,
    cancel: CancellationToken,
}

impl Core {
    pub fn new(
        persistence: Arc<dyn PersistenceAdapter>,
        connector: Arc<dyn WorkerConnector>,
        config: CoreConfig,
    ) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let table = Arc::new(TaskTable::new());
        let queue = Arc::new(TaskQueue::new());
        let tau_store = Arc::new(TauStore::new(config.tau_lambda));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&table),
            Arc::clone(&queue),
            Arc::clone(&tau_store),
            Arc::clone(&persistence),
            config.clone(),
        ));
        let reconnect_monitor = Arc::new(ReconnectionMonitor::new(
            Arc::clone(&registry),
            connector,
            config.clone(),
        ));

        Self {
            registry,
            table,
            queue,
            tau_store,
            persistence,
            config,
            dispatcher,
            reconnect_monitor,
            cancel: CancellationToken::new(),
        }
    }

    /// Startup rehydration (§4.7): workers come back inactive until a
    /// heartbeat arrives; non-terminal tasks are reloaded, with any
    /// RUNNING task treated as a lost assignment and reset to QUEUED with
    /// a freshly computed deadline.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        self.persistence.mark_all_workers_inactive().await?;
        for worker in self.persistence.list_workers().await? {
            self.registry
                .upsert_on_register(&worker.worker_id, &worker.address, worker.total, None)?;
        }

        let mut rehydrated = Vec::new();
        for mut task in self.persistence.list_non_terminal_tasks().await? {
            if task.status == TaskStatus::Running {
                tracing::warn!(task_id = %task.task_id, "resetting orphaned running task to queued on rehydration");
                let estimate = self.tau_store.get(&task.fingerprint, self.config.tau_floor);
                let offset = self.config.deadline_offset(estimate.tau, estimate.confidence);
                task.status = TaskStatus::Queued;
                task.assigned_worker = None;
                task.started_at = None;
                task.load_at_assignment = None;
                task.reservation_id = None;
                task.deadline = Some(task.created_at + to_chrono(offset));
                let _ = self
                    .persistence
                    .update_task_status_cas(task.task_id, TaskStatus::Running, TaskStatus::Queued)
                    .await;
            }
            if task.status == TaskStatus::Pending {
                // A crash between `insert_task` and the pending->queued transition
                // (see `submit`) leaves a row stuck PENDING forever otherwise — it
                // never matches the Running branch above nor the Queued push below.
                tracing::warn!(task_id = %task.task_id, "recovering task stuck pending before the queued transition on rehydration");
                task.status = TaskStatus::Queued;
                let _ = self
                    .persistence
                    .update_task_status_cas(task.task_id, TaskStatus::Pending, TaskStatus::Queued)
                    .await;
            }
            if task.status == TaskStatus::Queued {
                self.queue.push(task.task_id, task.deadline, task.created_at);
            }
            rehydrated.push(task);
        }
        self.table.rehydrate(rehydrated);
        Ok(())
    }

    /// `Submit(task_spec) -> task_id` (§6).
    pub async fn submit(&self, spec: TaskSpec) -> anyhow::Result<Uuid> {
        let task_id = Uuid::new_v4();
        let command = spec.command.unwrap_or_default();
        let fp = fingerprint::fingerprint(&spec.docker_image, &command);
        let estimate = self.tau_store.get(&fp, self.config.tau_floor);
        let offset = self.config.deadline_offset(estimate.tau, estimate.confidence);
        let now = Utc::now();

        let task = Task {
            task_id,
            user_id: spec.user_id,
            docker_image: spec.docker_image,
            command,
            required: ResourceVector::new(
                spec.cpu_required,
                spec.memory_required,
                spec.storage_required.unwrap_or(0.0),
                spec.gpu_required.unwrap_or(0.0),
            ),
            status: TaskStatus::Queued,
            fingerprint: fp,
            created_at: now,
            started_at: None,
            completed_at: None,
            deadline: Some(now + to_chrono(offset)),
            assigned_worker: None,
            load_at_assignment: None,
            reservation_id: None,
            sla_met: None,
        };

        self.table.insert_queued(task.clone());
        self.queue.push(task.task_id, task.deadline, task.created_at);

        match with_bounded_retry(3, || async { self.persistence.insert_task(&task).await }).await {
            Ok(()) => {
                // `insert_task` lands the row as PENDING; land it on QUEUED here so
                // it matches the in-memory state §4.3 promises ("Stores as QUEUED")
                // and so set_assignment's `WHERE status = 'queued'` has something to match.
                if let Err(err) = with_bounded_retry(3, || async {
                    self.persistence
                        .update_task_status_cas(task_id, TaskStatus::Pending, TaskStatus::Queued)
                        .await
                        .map(|_| ())
                })
                .await
                {
                    tracing::error!(task_id = %task_id, error = %err, "failed to persist pending->queued transition after retries");
                }
            }
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "failed to persist submitted task after retries");
            }
        }

        self.dispatcher.wake_handle().notify_one();
        Ok(task_id)
    }

    /// `Cancel(task_id)` (§4.3).
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), CoreError> {
        match self.table.cancel(task_id)? {
            CancelOutcome::CancelledImmediately => {
                self.queue.remove(task_id);
                let _ = self
                    .persistence
                    .update_task_status_cas(task_id, TaskStatus::Queued, TaskStatus::Cancelled)
                    .await;
            }
            CancelOutcome::CancelRequested => {
                if let Some(task) = self.table.get(task_id) {
                    if let Some(worker_id) = &task.assigned_worker {
                        let _ = self
                            .registry
                            .try_dispatch(worker_id, OutboundMessage::Cancel { task_id });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.table.get(task_id)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.table.list(filter)
    }

    /// Unschedulability summary for operators (§7).
    pub fn queue_health(&self) -> crate::task::queue::QueueHealth {
        self.queue.health(Utc::now())
    }

    /// `RegisterWorker(worker_id, address, capacities)` (§6).
    pub async fn register_worker(
        &self,
        worker_id: &str,
        address: &str,
        total: ResourceVector,
    ) -> Result<(), CoreError> {
        self.registry.upsert_on_register(worker_id, address, total, None)?;
        if let Err(err) = self.persistence.insert_worker(worker_id, address, total).await {
            tracing::error!(worker_id, error = %err, "failed to persist worker registration");
        }
        self.dispatcher.wake_handle().notify_one();
        Ok(())
    }

    /// `Heartbeat(worker_id, telemetry)` (§6).
    pub async fn heartbeat(&self, worker_id: &str, telemetry: Telemetry) -> Result<(), CoreError> {
        let ts = telemetry.ts;
        self.registry.heartbeat(worker_id, &telemetry)?;
        let _ = self.persistence.update_worker_heartbeat(worker_id, ts).await;
        self.dispatcher.wake_handle().notify_one();
        Ok(())
    }

    /// `ReportCompletion(worker_id, task_id, status, logs, finished_at)` (§4.5, §6).
    pub async fn report_completion(&self, report: CompletionReport) -> anyhow::Result<CompletionResult> {
        let result = completion::report_completion(
            &self.registry,
            &self.table,
            &self.tau_store,
            self.persistence.as_ref(),
            report,
        )
        .await?;
        self.dispatcher.wake_handle().notify_one();
        Ok(result)
    }

    /// Spawn the Dispatcher, Reconnection Monitor, and sweeper loops.
    /// Callers keep the returned handles to await clean shutdown after
    /// calling [`Core::shutdown`].
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatcher_cancel = self.cancel.clone();
        let dispatcher_handle = tokio::spawn(async move { dispatcher.run(dispatcher_cancel).await });

        let reconnect_monitor = Arc::clone(&self.reconnect_monitor);
        let reconnect_cancel = self.cancel.clone();
        let reconnect_handle =
            tokio::spawn(async move { reconnect_monitor.run(reconnect_cancel).await });

        let sweeper_core = Arc::clone(self);
        let sweeper_cancel = self.cancel.clone();
        let sweeper_handle = tokio::spawn(async move { sweeper_core.run_sweepers(sweeper_cancel).await });

        vec![dispatcher_handle, reconnect_handle, sweeper_handle]
    }

    /// Cooperative shutdown: signals every background loop to stop (§5).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Drive one dispatch pass without starting the background loop.
    /// Exposed for deterministic integration tests that need to assert on
    /// state between a submission and a dispatch without racing a timer.
    pub async fn dispatch_once(&self) {
        self.dispatcher.dispatch_pass().await;
    }

    async fn run_sweepers(self: Arc<Self>, cancel: CancellationToken) {
        let interval = (self.config.worker_stale_timeout / 3).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("sweepers shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// Drive one sweeper pass (stale workers + expired reservations)
    /// without starting the background loop. Exposed for deterministic
    /// integration tests, same rationale as [`Core::dispatch_once`].
    pub async fn sweep_once(&self) {
        let stale = self.registry.sweep_stale(self.config.worker_stale_timeout);
        for worker_id in &stale {
            let _ = self.persistence.mark_worker_inactive(worker_id).await;
        }

        let expired = self.registry.sweep_expired_reservations(Utc::now());
        let mut any_expired = false;
        for item in expired {
            any_expired = true;
            if let Ok(Some(task)) = self.table.fail_reservation_expired(item.task_id) {
                tracing::warn!(task_id = %task.task_id, worker_id = %item.worker_id, "reservation expired, task failed");
                let _ = self
                    .persistence
                    .set_terminal(task.task_id, TaskStatus::Failed, Utc::now(), Some(false))
                    .await;
            }
        }
        if any_expired {
            self.dispatcher.wake_handle().notify_one();
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(30))
}
