//! Persistence Adapter (§4.7): a narrow DAO seam in front of the document
//! store. The core mutates in-memory state first and writes through this
//! trait after the fact for Tasks and Reservations (write-behind); worker
//! registration/unregistration write through immediately.
//!
//! [`PostgresPersistence`] is the only implementation shipped here, backed
//! by `taskmaster-db`'s query functions — the DAO contract itself (this
//! trait) is what lets the orchestration core stay agnostic of the
//! concrete store, per §4.7 and §6.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use taskmaster_db::models::{ReportStatus as DbReportStatus, TaskFilter as DbTaskFilter};
use taskmaster_db::queries::{assignments, results, tasks as task_queries, workers};

use crate::registry::{ResourceVector, WorkerView};
use crate::rpc::ReportStatus;
use crate::task::{Task, TaskStatus};

/// The narrow DAO the orchestration core consumes (§6: "Persistence DAO").
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn insert_worker(&self, worker_id: &str, address: &str, total: ResourceVector) -> anyhow::Result<()>;
    async fn update_worker_allocated(&self, worker_id: &str, allocated: ResourceVector) -> anyhow::Result<()>;
    async fn update_worker_heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn mark_worker_inactive(&self, worker_id: &str) -> anyhow::Result<()>;
    async fn mark_all_workers_inactive(&self) -> anyhow::Result<()>;
    async fn delete_worker(&self, worker_id: &str) -> anyhow::Result<()>;
    async fn list_workers(&self) -> anyhow::Result<Vec<WorkerView>>;

    async fn insert_task(&self, task: &Task) -> anyhow::Result<()>;
    async fn update_task_status_cas(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        new_status: TaskStatus,
    ) -> anyhow::Result<u64>;
    async fn set_assignment(&self, task_id: Uuid, worker_id: &str, started_at: DateTime<Utc>) -> anyhow::Result<u64>;
    async fn set_terminal(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        completed_at: DateTime<Utc>,
        sla_met: Option<bool>,
    ) -> anyhow::Result<()>;
    async fn list_non_terminal_tasks(&self) -> anyhow::Result<Vec<Task>>;

    async fn insert_assignment(&self, ass_id: Uuid, task_id: Uuid, worker_id: &str, assigned_at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn insert_result(
        &self,
        id: Uuid,
        task_id: Uuid,
        worker_id: &str,
        status: ReportStatus,
        logs: &str,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

/// Postgres-backed [`PersistenceAdapter`], delegating to `taskmaster-db`'s
/// query functions.
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn report_status_to_db(status: ReportStatus) -> DbReportStatus {
    match status {
        ReportStatus::Success => DbReportStatus::Success,
        ReportStatus::Failed => DbReportStatus::Failed,
        ReportStatus::Cancelled => DbReportStatus::Cancelled,
    }
}

fn task_row_to_task(row: taskmaster_db::models::TaskRow) -> Task {
    Task {
        task_id: row.task_id,
        user_id: row.user_id,
        docker_image: row.docker_image,
        command: row.command,
        required: ResourceVector::new(
            row.cpu_required,
            row.memory_required,
            row.storage_required,
            row.gpu_required,
        ),
        status: row.status.into(),
        fingerprint: row.fingerprint,
        created_at: row.created_at,
        started_at: row.started_at,
        completed_at: row.completed_at,
        deadline: row.deadline,
        assigned_worker: row.assigned_worker,
        load_at_assignment: None,
        reservation_id: None,
        sla_met: row.sla_met,
    }
}

fn worker_row_to_view(row: taskmaster_db::models::WorkerRow) -> WorkerView {
    WorkerView {
        worker_id: row.worker_id,
        address: row.address,
        total: ResourceVector::new(row.total_cpu, row.total_memory, row.total_storage, row.total_gpu),
        allocated: ResourceVector::new(
            row.allocated_cpu,
            row.allocated_memory,
            row.allocated_storage,
            row.allocated_gpu,
        ),
        is_active: row.is_active,
        last_heartbeat: row.last_heartbeat,
        registered_at: row.registered_at,
        updated_at: row.updated_at,
        has_outbound: false,
    }
}

#[async_trait]
impl PersistenceAdapter for PostgresPersistence {
    async fn insert_worker(&self, worker_id: &str, address: &str, total: ResourceVector) -> anyhow::Result<()> {
        workers::insert_worker(
            &self.pool,
            worker_id,
            address,
            total.cpu,
            total.memory,
            total.storage,
            total.gpu,
        )
        .await?;
        Ok(())
    }

    async fn update_worker_allocated(&self, worker_id: &str, allocated: ResourceVector) -> anyhow::Result<()> {
        workers::update_allocated(
            &self.pool,
            worker_id,
            allocated.cpu,
            allocated.memory,
            allocated.storage,
            allocated.gpu,
        )
        .await
    }

    async fn update_worker_heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        workers::update_heartbeat(&self.pool, worker_id, at).await?;
        Ok(())
    }

    async fn mark_worker_inactive(&self, worker_id: &str) -> anyhow::Result<()> {
        workers::mark_inactive(&self.pool, worker_id).await
    }

    async fn mark_all_workers_inactive(&self) -> anyhow::Result<()> {
        workers::mark_all_inactive(&self.pool).await
    }

    async fn delete_worker(&self, worker_id: &str) -> anyhow::Result<()> {
        workers::delete_worker(&self.pool, worker_id).await?;
        Ok(())
    }

    async fn list_workers(&self) -> anyhow::Result<Vec<WorkerView>> {
        let rows = workers::list_workers(&self.pool).await?;
        Ok(rows.into_iter().map(worker_row_to_view).collect())
    }

    async fn insert_task(&self, task: &Task) -> anyhow::Result<()> {
        task_queries::insert_task(
            &self.pool,
            task.task_id,
            task.user_id.as_deref(),
            &task.docker_image,
            &task.command,
            task.required.cpu,
            task.required.memory,
            task.required.storage,
            task.required.gpu,
            &task.fingerprint,
            task.deadline,
        )
        .await?;
        Ok(())
    }

    async fn update_task_status_cas(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        new_status: TaskStatus,
    ) -> anyhow::Result<u64> {
        task_queries::update_status_cas(&self.pool, task_id, expected.into(), new_status.into()).await
    }

    async fn set_assignment(&self, task_id: Uuid, worker_id: &str, started_at: DateTime<Utc>) -> anyhow::Result<u64> {
        task_queries::set_assignment(&self.pool, task_id, worker_id, started_at).await
    }

    async fn set_terminal(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        completed_at: DateTime<Utc>,
        sla_met: Option<bool>,
    ) -> anyhow::Result<()> {
        task_queries::set_terminal(&self.pool, task_id, status.into(), completed_at, sla_met).await
    }

    async fn list_non_terminal_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let rows = task_queries::list_non_terminal(&self.pool).await?;
        Ok(rows.into_iter().map(task_row_to_task).collect())
    }

    async fn insert_assignment(&self, ass_id: Uuid, task_id: Uuid, worker_id: &str, assigned_at: DateTime<Utc>) -> anyhow::Result<()> {
        assignments::insert_assignment(&self.pool, ass_id, task_id, worker_id, assigned_at).await?;
        Ok(())
    }

    async fn insert_result(
        &self,
        id: Uuid,
        task_id: Uuid,
        worker_id: &str,
        status: ReportStatus,
        logs: &str,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        results::insert_result(
            &self.pool,
            id,
            task_id,
            worker_id,
            report_status_to_db(status),
            logs,
            completed_at,
        )
        .await?;
        Ok(())
    }
}

#[allow(unused)]
fn _assert_object_safe(_: &dyn PersistenceAdapter) {}

/// Unused when no persistence-layer filter is needed; kept so callers can
/// translate the core's task filter into the DB crate's without a direct
/// dependency edge at the call site.
pub fn to_db_filter(filter: &crate::task::table::TaskFilter) -> DbTaskFilter {
    DbTaskFilter {
        status: filter.status.map(Into::into),
        user_id: filter.user_id.clone(),
        assigned_worker: filter.assigned_worker.clone(),
    }
}
