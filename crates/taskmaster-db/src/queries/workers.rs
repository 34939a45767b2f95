//! Database query functions for the `workers` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::WorkerRow;

/// Insert a new worker row (write-through: the registry inserts on
/// registration before accepting traffic, §4.7).
#[allow(clippy::too_many_arguments)]
pub async fn insert_worker(
    pool: &PgPool,
    worker_id: &str,
    address: &str,
    total_cpu: f64,
    total_memory: f64,
    total_storage: f64,
    total_gpu: f64,
) -> Result<WorkerRow> {
    let worker = sqlx::query_as::<_, WorkerRow>(
        "INSERT INTO workers (worker_id, address, total_cpu, total_memory, total_storage, total_gpu) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (worker_id) DO UPDATE SET \
           address = EXCLUDED.address, \
           total_cpu = EXCLUDED.total_cpu, \
           total_memory = EXCLUDED.total_memory, \
           total_storage = EXCLUDED.total_storage, \
           total_gpu = EXCLUDED.total_gpu, \
           updated_at = now() \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(address)
    .bind(total_cpu)
    .bind(total_memory)
    .bind(total_storage)
    .bind(total_gpu)
    .fetch_one(pool)
    .await
    .context("failed to insert worker")?;

    Ok(worker)
}

/// Update a worker's allocated-resource counters (write-behind from the
/// registry after a reserve/release).
pub async fn update_allocated(
    pool: &PgPool,
    worker_id: &str,
    allocated_cpu: f64,
    allocated_memory: f64,
    allocated_storage: f64,
    allocated_gpu: f64,
) -> Result<()> {
    sqlx::query(
        "UPDATE workers SET \
           allocated_cpu = $1, allocated_memory = $2, allocated_storage = $3, allocated_gpu = $4, \
           updated_at = now() \
         WHERE worker_id = $5",
    )
    .bind(allocated_cpu)
    .bind(allocated_memory)
    .bind(allocated_storage)
    .bind(allocated_gpu)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to update worker allocation")?;

    Ok(())
}

/// Record a heartbeat: refresh `last_heartbeat` and mark the worker active.
pub async fn update_heartbeat(
    pool: &PgPool,
    worker_id: &str,
    at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers SET last_heartbeat = $1, is_active = TRUE, updated_at = now() \
         WHERE worker_id = $2",
    )
    .bind(at)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to update worker heartbeat")?;

    Ok(result.rows_affected())
}

/// Mark a worker inactive (used by the stale-worker sweeper).
pub async fn mark_inactive(pool: &PgPool, worker_id: &str) -> Result<()> {
    sqlx::query("UPDATE workers SET is_active = FALSE, updated_at = now() WHERE worker_id = $1")
        .bind(worker_id)
        .execute(pool)
        .await
        .context("failed to mark worker inactive")?;

    Ok(())
}

/// Mark every worker inactive. Used during startup rehydration: workers are
/// rehydrated as inactive until a heartbeat arrives (§4.7).
pub async fn mark_all_inactive(pool: &PgPool) -> Result<()> {
    sqlx::query("UPDATE workers SET is_active = FALSE, updated_at = now()")
        .execute(pool)
        .await
        .context("failed to mark all workers inactive")?;

    Ok(())
}

/// Delete a worker (explicit unregistration only, §3).
pub async fn delete_worker(pool: &PgPool, worker_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM workers WHERE worker_id = $1")
        .bind(worker_id)
        .execute(pool)
        .await
        .context("failed to delete worker")?;

    Ok(result.rows_affected())
}

/// List every known worker.
pub async fn list_workers(pool: &PgPool) -> Result<Vec<WorkerRow>> {
    let workers = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers ORDER BY worker_id")
        .fetch_all(pool)
        .await
        .context("failed to list workers")?;

    Ok(workers)
}
