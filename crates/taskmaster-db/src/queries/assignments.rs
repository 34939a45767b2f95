//! Database query functions for the `assignments` audit table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::AssignmentRow;

/// Insert an assignment record: one row per successful dispatch, never
/// updated or deleted (§3).
pub async fn insert_assignment(
    pool: &PgPool,
    ass_id: Uuid,
    task_id: Uuid,
    worker_id: &str,
    assigned_at: DateTime<Utc>,
) -> Result<AssignmentRow> {
    let assignment = sqlx::query_as::<_, AssignmentRow>(
        "INSERT INTO assignments (ass_id, task_id, worker_id, assigned_at) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(ass_id)
    .bind(task_id)
    .bind(worker_id)
    .bind(assigned_at)
    .fetch_one(pool)
    .await
    .context("failed to insert assignment")?;

    Ok(assignment)
}

/// List every assignment recorded for a task, oldest first. A task may have
/// more than one assignment row if it was reconnected and redispatched.
pub async fn list_assignments_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<AssignmentRow>> {
    let assignments = sqlx::query_as::<_, AssignmentRow>(
        "SELECT * FROM assignments WHERE task_id = $1 ORDER BY assigned_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list assignments for task")?;

    Ok(assignments)
}
