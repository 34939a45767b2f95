//! `taskmaster status` and `taskmaster worker list`: read-only reporting
//! against the persisted database state.

use anyhow::Result;
use sqlx::PgPool;

use taskmaster_db::models::{TaskFilter, TaskStatus};
use taskmaster_db::queries::{tasks as task_db, workers as worker_db};

/// Print a summary of task counts by status, optionally narrowed to one
/// worker or user.
pub async fn run_status(pool: &PgPool, user_id: Option<&str>, assigned_worker: Option<&str>) -> Result<()> {
    let filter = TaskFilter {
        status: None,
        user_id: user_id.map(str::to_owned),
        assigned_worker: assigned_worker.map(str::to_owned),
    };
    let tasks = task_db::list_tasks(pool, &filter).await?;

    let mut pending = 0;
    let mut queued = 0;
    let mut running = 0;
    let mut completed = 0;
    let mut failed = 0;
    let mut cancelled = 0;
    for task in &tasks {
        match task.status {
            TaskStatus::Pending => pending += 1,
            TaskStatus::Queued => queued += 1,
            TaskStatus::Running => running += 1,
            TaskStatus::Completed => completed += 1,
            TaskStatus::Failed => failed += 1,
            TaskStatus::Cancelled => cancelled += 1,
        }
    }

    println!("tasks: {} total", tasks.len());
    println!(
        "  pending={pending} queued={queued} running={running} completed={completed} failed={failed} cancelled={cancelled}"
    );

    if !tasks.is_empty() {
        println!();
        println!("{:<38} {:<10} {:<20} {:<10}", "task_id", "status", "worker", "sla_met");
        for task in &tasks {
            println!(
                "{:<38} {:<10} {:<20} {:<10}",
                task.task_id,
                task.status,
                task.assigned_worker.as_deref().unwrap_or("-"),
                task.sla_met
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
    }

    Ok(())
}

/// List every known worker with its current allocation.
pub async fn run_worker_list(pool: &PgPool) -> Result<()> {
    let workers = worker_db::list_workers(pool).await?;

    if workers.is_empty() {
        println!("no workers registered");
        return Ok(());
    }

    println!(
        "{:<20} {:<24} {:<8} {:<12} {:<12}",
        "worker_id", "address", "active", "cpu", "memory"
    );
    for worker in &workers {
        println!(
            "{:<20} {:<24} {:<8} {:<12} {:<12}",
            worker.worker_id,
            worker.address,
            worker.is_active,
            format!("{:.1}/{:.1}", worker.allocated_cpu, worker.total_cpu),
            format!("{:.1}/{:.1}", worker.allocated_memory, worker.total_memory),
        );
    }

    Ok(())
}
