//! Database query functions for the `results` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ReportStatus, ResultRow};

/// Insert a completion result. One row per report accepted by the
/// completion pipeline; a report rejected as stale never reaches here.
pub async fn insert_result(
    pool: &PgPool,
    id: Uuid,
    task_id: Uuid,
    worker_id: &str,
    status: ReportStatus,
    logs: &str,
    completed_at: DateTime<Utc>,
) -> Result<ResultRow> {
    let result = sqlx::query_as::<_, ResultRow>(
        "INSERT INTO results (id, task_id, worker_id, status, logs, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(id)
    .bind(task_id)
    .bind(worker_id)
    .bind(status)
    .bind(logs)
    .bind(completed_at)
    .fetch_one(pool)
    .await
    .context("failed to insert result")?;

    Ok(result)
}

/// Fetch the result recorded for a task, if any.
pub async fn get_result_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<ResultRow>> {
    let result = sqlx::query_as::<_, ResultRow>("SELECT * FROM results WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch result for task")?;

    Ok(result)
}
