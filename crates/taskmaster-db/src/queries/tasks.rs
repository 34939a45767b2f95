//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskFilter, TaskRow, TaskStatus};

/// Insert a new task row in `pending` status.
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    task_id: Uuid,
    user_id: Option<&str>,
    docker_image: &str,
    command: &str,
    cpu_required: f64,
    memory_required: f64,
    storage_required: f64,
    gpu_required: f64,
    fingerprint: &str,
    deadline: Option<DateTime<Utc>>,
) -> Result<TaskRow> {
    let task = sqlx::query_as::<_, TaskRow>(
        "INSERT INTO tasks \
         (task_id, user_id, docker_image, command, cpu_required, memory_required, \
          storage_required, gpu_required, status, fingerprint, deadline) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(user_id)
    .bind(docker_image)
    .bind(command)
    .bind(cpu_required)
    .bind(memory_required)
    .bind(storage_required)
    .bind(gpu_required)
    .bind(fingerprint)
    .bind(deadline)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskRow>> {
    let task = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks matching an optional filter, ordered by creation time.
pub async fn list_tasks(pool: &PgPool, filter: &TaskFilter) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR user_id = $2) \
           AND ($3::text IS NULL OR assigned_worker = $3) \
         ORDER BY created_at ASC",
    )
    .bind(filter.status.map(|s| s.to_string()))
    .bind(&filter.user_id)
    .bind(&filter.assigned_worker)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Conditionally update a task's status: the update only applies if the
/// current status matches `expected` (compare-and-set, §6: "must be
/// conditional to detect concurrent reset during crash recovery").
///
/// Returns the number of rows affected (0 or 1).
pub async fn update_status_cas(
    pool: &PgPool,
    task_id: Uuid,
    expected: TaskStatus,
    new_status: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $1 WHERE task_id = $2 AND status = $3",
    )
    .bind(new_status)
    .bind(task_id)
    .bind(expected)
    .execute(pool)
    .await
    .context("failed to update task status")?;

    Ok(result.rows_affected())
}

/// Unconditionally force a task's status, used only by the startup
/// rehydration path (§4.7: lost RUNNING assignments reset to QUEUED).
pub async fn force_status(pool: &PgPool, task_id: Uuid, new_status: TaskStatus) -> Result<()> {
    sqlx::query("UPDATE tasks SET status = $1 WHERE task_id = $2")
        .bind(new_status)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to force task status")?;
    Ok(())
}

/// Record a successful dispatch: sets `assigned_worker` and `started_at`
/// and transitions the task to `running`.
pub async fn set_assignment(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    started_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'running', assigned_worker = $1, started_at = $2 \
         WHERE task_id = $3 AND status = 'queued'",
    )
    .bind(worker_id)
    .bind(started_at)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set task assignment")?;

    Ok(result.rows_affected())
}

/// Record a terminal transition: sets `completed_at`, `sla_met`, and the
/// terminal status together.
pub async fn set_terminal(
    pool: &PgPool,
    task_id: Uuid,
    status: TaskStatus,
    completed_at: DateTime<Utc>,
    sla_met: Option<bool>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET status = $1, completed_at = $2, sla_met = $3 WHERE task_id = $4",
    )
    .bind(status)
    .bind(completed_at)
    .bind(sla_met)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set terminal task state")?;

    Ok(())
}

/// List every non-terminal task, used by the startup rehydration path.
pub async fn list_non_terminal(pool: &PgPool) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks WHERE status IN ('pending', 'queued', 'running') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list non-terminal tasks")?;

    Ok(tasks)
}
