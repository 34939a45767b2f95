//! End-to-end scenarios against a real `Core` backed by Postgres (§8:
//! "Concrete scenarios"). Each test creates a unique temporary database,
//! runs migrations, and drops it on completion so tests are fully isolated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use taskmaster_core::{Core, CoreConfig, PostgresPersistence, ResourceVector, TaskSpec};
use taskmaster_core::rpc::{CompletionReport, OutboundSender, ReportStatus, WorkerConnector};
use taskmaster_core::task::TaskStatus;
use taskmaster_test_utils::{create_test_db, drop_test_db};

/// A connector that never succeeds, matching the CLI's production stub —
/// these tests register workers' outbound channels directly instead of
/// going through the Reconnection Monitor.
struct NoConnector;

#[async_trait]
impl WorkerConnector for NoConnector {
    async fn connect(
        &self,
        _worker_id: &str,
        _address: &str,
        _capacity: usize,
        _timeout: Duration,
    ) -> anyhow::Result<OutboundSender> {
        anyhow::bail!("no transport configured in tests")
    }
}

struct TestHarness {
    core: Arc<Core>,
    pool: sqlx::PgPool,
    db_name: String,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_config(CoreConfig::default()).await
    }

    async fn with_config(config: CoreConfig) -> Self {
        let (pool, db_name) = create_test_db().await;
        let persistence = Arc::new(PostgresPersistence::new(pool.clone()));
        let connector = Arc::new(NoConnector);
        let core = Arc::new(Core::new(persistence, connector, config));
        core.bootstrap().await.expect("bootstrap should succeed");
        Self { core, pool, db_name }
    }

    /// Simulate a Master restart: build a brand new `Core` against the same
    /// database and run its startup rehydration, without dropping the
    /// original pool/database (§4.7).
    async fn restart(&self, config: CoreConfig) -> Arc<Core> {
        let persistence = Arc::new(PostgresPersistence::new(self.pool.clone()));
        let connector = Arc::new(NoConnector);
        let core = Arc::new(Core::new(persistence, connector, config));
        core.bootstrap().await.expect("bootstrap should succeed");
        core
    }

    /// Register a worker and give it a draining outbound channel so the
    /// Dispatcher can hand it work without a live transport. Two calls,
    /// matching the real registration-then-connect sequence: registration
    /// alone never flips `is_active` (§4.2).
    fn register_active_worker(&self, worker_id: &str, total: ResourceVector) -> mpsc::Receiver<taskmaster_core::rpc::OutboundMessage> {
        self.core
            .registry
            .upsert_on_register(worker_id, &format!("{worker_id}:9000"), total, None)
            .expect("register should succeed");
        let (tx, rx) = mpsc::channel(self.core.config.dispatch_channel_capacity);
        self.core
            .registry
            .set_outbound_and_activate(worker_id, tx)
            .expect("activate should succeed");
        rx
    }

    async fn teardown(self) {
        drop_test_db(&self.db_name).await;
    }
}

fn small_spec(cpu: f64, memory: f64) -> TaskSpec {
    TaskSpec {
        docker_image: "alpine".into(),
        command: Some("echo hi".into()),
        cpu_required: cpu,
        memory_required: memory,
        storage_required: None,
        gpu_required: None,
        user_id: None,
    }
}

#[tokio::test]
async fn happy_path_submit_dispatch_complete() {
    let harness = TestHarness::new().await;
    let _rx = harness.register_active_worker("w1", ResourceVector::new(4.0, 8.0, 0.0, 0.0));

    let task_id = harness
        .core
        .submit(small_spec(1.0, 1.0))
        .await
        .expect("submit should succeed");

    harness.core.dispatch_once().await;

    let task = harness.core.get_task(task_id).expect("task should exist");
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.assigned_worker.as_deref(), Some("w1"));

    let report = CompletionReport {
        worker_id: "w1".into(),
        task_id,
        status: ReportStatus::Success,
        logs: "done".into(),
        finished_at: Utc::now(),
    };
    harness.core.report_completion(report).await.expect("completion should apply");

    let task = harness.core.get_task(task_id).expect("task should still exist");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.sla_met, Some(true));

    harness.teardown().await;
}

#[tokio::test]
async fn insufficient_fit_then_fit_after_second_worker_registers() {
    let harness = TestHarness::new().await;
    let _small_rx = harness.register_active_worker("tiny", ResourceVector::new(1.0, 1.0, 0.0, 0.0));

    let task_id = harness
        .core
        .submit(small_spec(4.0, 4.0))
        .await
        .expect("submit should succeed");

    harness.core.dispatch_once().await;
    let task = harness.core.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Queued, "no worker fits yet");
    let health = harness.core.queue_health();
    assert_eq!(health.unfulfillable, 1);

    let _big_rx = harness.register_active_worker("big", ResourceVector::new(8.0, 8.0, 0.0, 0.0));
    harness.core.dispatch_once().await;

    let task = harness.core.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.assigned_worker.as_deref(), Some("big"));

    harness.teardown().await;
}

#[tokio::test]
async fn expired_reservation_fails_the_task_and_releases_capacity() {
    // A near-zero TTL so the reservation is already expired by the time we
    // sweep, without needing to sleep past a realistic multi-second TTL.
    let mut config = CoreConfig::default();
    config.tau_floor = Duration::from_millis(1);
    config.reservation_ttl_floor = Duration::from_millis(1);
    config.reservation_ttl_multiplier = 1.0;
    let harness = TestHarness::with_config(config).await;
    let _rx = harness.register_active_worker("w1", ResourceVector::new(4.0, 4.0, 0.0, 0.0));

    let task_id = harness
        .core
        .submit(small_spec(1.0, 1.0))
        .await
        .expect("submit should succeed");
    harness.core.dispatch_once().await;

    let running = harness.core.get_task(task_id).unwrap();
    assert_eq!(running.status, TaskStatus::Running);

    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.core.sweep_once().await;

    let task = harness.core.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.sla_met, Some(false));

    let worker = harness.core.registry.get("w1").unwrap();
    assert_eq!(worker.allocated, ResourceVector::ZERO);

    harness.teardown().await;
}

#[tokio::test]
async fn duplicate_completion_report_is_a_no_op() {
    let harness = TestHarness::new().await;
    let _rx = harness.register_active_worker("w1", ResourceVector::new(4.0, 4.0, 0.0, 0.0));

    let task_id = harness.core.submit(small_spec(1.0, 1.0)).await.unwrap();
    harness.core.dispatch_once().await;

    let report = CompletionReport {
        worker_id: "w1".into(),
        task_id,
        status: ReportStatus::Success,
        logs: "done".into(),
        finished_at: Utc::now(),
    };
    harness.core.report_completion(report.clone()).await.unwrap();
    let second = harness.core.report_completion(report).await.unwrap();
    assert!(matches!(
        second,
        taskmaster_core::completion::CompletionResult::Stale
    ));

    let task = harness.core.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    harness.teardown().await;
}

#[tokio::test]
async fn cancel_while_running_releases_capacity_on_worker_ack() {
    let harness = TestHarness::new().await;
    let mut rx = harness.register_active_worker("w1", ResourceVector::new(4.0, 4.0, 0.0, 0.0));

    let task_id = harness.core.submit(small_spec(1.0, 1.0)).await.unwrap();
    harness.core.dispatch_once().await;
    // Drain the dispatch message before the cancel message arrives.
    let _ = rx.recv().await.expect("dispatch message should be queued");

    harness.core.cancel(task_id).await.expect("cancel should succeed");
    let task = harness.core.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Running, "still running until the worker acks");

    let cancel_msg = rx.recv().await.expect("cancel message should be queued");
    assert!(matches!(
        cancel_msg,
        taskmaster_core::rpc::OutboundMessage::Cancel { task_id: id } if id == task_id
    ));

    let report = CompletionReport {
        worker_id: "w1".into(),
        task_id,
        status: ReportStatus::Cancelled,
        logs: String::new(),
        finished_at: Utc::now(),
    };
    harness.core.report_completion(report).await.unwrap();

    let task = harness.core.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let worker = harness.core.registry.get("w1").unwrap();
    assert_eq!(worker.allocated, ResourceVector::ZERO);

    harness.teardown().await;
}

#[tokio::test]
async fn stale_worker_sweep_marks_worker_inactive() {
    // A zero stale timeout: any elapsed time since registration counts as stale.
    let mut config = CoreConfig::default();
    config.worker_stale_timeout = Duration::ZERO;
    let harness = TestHarness::with_config(config).await;
    let _rx = harness.register_active_worker("w1", ResourceVector::new(4.0, 4.0, 0.0, 0.0));

    tokio::time::sleep(Duration::from_millis(5)).await;
    harness.core.sweep_once().await;

    let worker = harness.core.registry.get("w1").expect("worker still known");
    assert!(!worker.is_active);

    harness.teardown().await;
}

#[tokio::test]
async fn restart_rehydrates_a_queued_task_and_re_enqueues_it() {
    let harness = TestHarness::new().await;

    // No worker registered, so the task stays queued and undispatched — the
    // durable row must land as 'queued' (not stuck 'pending') for rehydration
    // to pick it back up after a restart (§4.3, §4.7).
    let task_id = harness
        .core
        .submit(small_spec(1.0, 1.0))
        .await
        .expect("submit should succeed");

    let queued = harness.core.get_task(task_id).expect("task should exist");
    assert_eq!(queued.status, TaskStatus::Queued);

    // Simulate the Master process dying and restarting: a fresh `Core`
    // against the same database, with no in-memory state carried over.
    let restarted = harness.restart(CoreConfig::default()).await;

    let rehydrated = restarted
        .get_task(task_id)
        .expect("task should survive the restart");
    assert_eq!(
        rehydrated.status,
        TaskStatus::Queued,
        "a task stuck pending before the queued transition must still rehydrate to queued"
    );

    let health = restarted.queue_health();
    assert_eq!(
        health.queued, 1,
        "rehydrated task must be pushed back onto the queue, not merely updated in the table"
    );

    // A worker registering after the restart should be able to pick it up.
    let (tx, mut rx) = mpsc::channel(restarted.config.dispatch_channel_capacity);
    restarted
        .registry
        .upsert_on_register("w1", "w1:9000", ResourceVector::new(4.0, 4.0, 0.0, 0.0), None)
        .expect("register should succeed");
    restarted
        .registry
        .set_outbound_and_activate("w1", tx)
        .expect("activate should succeed");
    restarted.dispatch_once().await;

    let dispatched = restarted.get_task(task_id).expect("task should still exist");
    assert_eq!(dispatched.status, TaskStatus::Running);
    assert_eq!(dispatched.assigned_worker.as_deref(), Some("w1"));
    let _ = rx.recv().await.expect("dispatch message should be queued");

    harness.teardown().await;
}
