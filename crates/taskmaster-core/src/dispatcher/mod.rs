//! Dispatcher / Scheduler (§4.4): the single logical actor that pairs
//! queued tasks with workers.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::persistence::PersistenceAdapter;
use crate::registry::{ResourceVector, WorkerRegistry, WorkerView};
use crate::retry::with_bounded_retry;
use crate::rpc::{DispatchTask, OutboundMessage};
use crate::task::queue::TaskQueue;
use crate::task::table::TaskTable;
use crate::task::TaskStatus;
use crate::tau::TauStore;

/// Pairs pending tasks with workers using first-fit-by-least-loaded.
///
/// Wakeups come from three sources, any of which triggers a pass (§4.4):
/// a new task admitted or a worker event (both via [`Dispatcher::wake`]),
/// or the periodic tick. Each pass is a single sweep of the queue in
/// deadline order; it never blocks waiting for a specific worker.
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    table: Arc<TaskTable>,
    queue: Arc<TaskQueue>,
    tau_store: Arc<TauStore>,
    persistence: Arc<dyn PersistenceAdapter>,
    config: CoreConfig,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        table: Arc<TaskTable>,
        queue: Arc<TaskQueue>,
        tau_store: Arc<TauStore>,
        persistence: Arc<dyn PersistenceAdapter>,
        config: CoreConfig,
    ) -> Self {
        Self {
            registry,
            table,
            queue,
            tau_store,
            persistence,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Clone of the wake handle. Submitting a task or observing a worker
    /// event should call `notify_one()` on this to trigger an out-of-band
    /// pass instead of waiting for the next tick.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Run the dispatch loop until `cancel` fires. Shutdown is cooperative:
    /// the in-flight pass (if any) finishes before the loop exits (§5).
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.dispatcher_tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.dispatch_pass().await;
        }
    }

    /// One full sweep of the queue (§4.4 steps 1-3). Public so callers
    /// (and tests) can drive a single deterministic pass without running
    /// the loop.
    pub async fn dispatch_pass(&self) {
        let queued = self.queue.snapshot();
        if queued.is_empty() {
            return;
        }

        let workers: Vec<WorkerView> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|w| w.is_active)
            .collect();
        if workers.is_empty() {
            return;
        }

        for task_id in queued {
            let Some(task) = self.table.get(task_id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                // Already handled by a concurrent pass or a cancel.
                continue;
            }

            let mut candidates: Vec<&WorkerView> =
                workers.iter().filter(|w| w.fits(task.required)).collect();
            if candidates.is_empty() {
                self.queue.mark_unfulfillable(task_id, Utc::now());
                continue;
            }
            candidates.sort_by(|a, b| {
                a.cpu_utilization()
                    .partial_cmp(&b.cpu_utilization())
                    .unwrap()
                    .then_with(|| a.worker_id.cmp(&b.worker_id))
            });

            let estimate = self.tau_store.get(&task.fingerprint, self.config.tau_floor);
            let ttl = self.config.reservation_ttl(estimate.tau);

            for candidate in candidates {
                let reservation_id =
                    match self
                        .registry
                        .reserve(task_id, &candidate.worker_id, task.required, ttl)
                    {
                        Ok(id) => id,
                        // Another pass won the race for this worker's capacity; try the next.
                        Err(_) => continue,
                    };

                let message = OutboundMessage::Dispatch(DispatchTask {
                    task_id,
                    docker_image: task.docker_image.clone(),
                    command: task.command.clone(),
                    resources: task.required,
                    deadline: task.deadline,
                });

                if self
                    .registry
                    .try_dispatch(&candidate.worker_id, message)
                    .is_err()
                {
                    // Outbound channel full or gone: release and try the next worker (§5).
                    let _ = self.registry.release(reservation_id);
                    continue;
                }

                self.commit_dispatch(task_id, &candidate.worker_id, reservation_id)
                    .await;
                break;
            }
        }
    }

    /// Dequeue, flip the task to RUNNING, and write through the
    /// assignment. If the in-memory commit itself fails (a concurrent
    /// cancel raced us), the reservation and outbound send are undone.
    async fn commit_dispatch(&self, task_id: Uuid, worker_id: &str, reservation_id: Uuid) {
        self.queue.remove(task_id);
        let started_at = Utc::now();
        let load_at_assignment = self
            .registry
            .get(worker_id)
            .map(|w| w.allocated)
            .unwrap_or(ResourceVector::ZERO);

        match self
            .table
            .try_dispatch(task_id, worker_id, started_at, load_at_assignment, reservation_id)
        {
            Ok(_) => {
                self.persist_assignment(task_id, worker_id, started_at).await;
            }
            Err(err) => {
                tracing::warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    error = %err,
                    "dispatch commit raced with a concurrent task mutation, rolling back reservation"
                );
                let _ = self.registry.release(reservation_id);
            }
        }
    }

    async fn persist_assignment(&self, task_id: Uuid, worker_id: &str, started_at: chrono::DateTime<Utc>) {
        let status_result = with_bounded_retry(3, || async {
            self.persistence
                .set_assignment(task_id, worker_id, started_at)
                .await
                .map(|_| ())
        })
        .await;
        if let Err(err) = status_result {
            tracing::error!(task_id = %task_id, error = %err, "failed to persist task assignment after retries; in-memory state remains authoritative");
        }

        let ass_id = Uuid::new_v4();
        let assignment_result = with_bounded_retry(3, || async {
            self.persistence
                .insert_assignment(ass_id, task_id, worker_id, started_at)
                .await
        })
        .await;
        if let Err(err) = assignment_result {
            tracing::error!(task_id = %task_id, error = %err, "failed to persist assignment audit row after retries");
        }
    }
}
