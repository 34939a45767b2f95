//! The Task Table: the by-id store of full task state across its
//! lifecycle (§4.3). Guarded by its own mutex, independent of the Queue's;
//! lock order when both are needed is Task Table first, then Queue (§5).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::registry::ResourceVector;

use super::{Task, TaskStateMachine, TaskStatus};

/// Filter accepted by [`TaskTable::list`] (§4.3: "List(filter) over
/// status/user/assigned_worker").
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub user_id: Option<String>,
    pub assigned_worker: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        self.status.map(|s| s == task.status).unwrap_or(true)
            && self
                .user_id
                .as_deref()
                .map(|u| task.user_id.as_deref() == Some(u))
                .unwrap_or(true)
            && self
                .assigned_worker
                .as_deref()
                .map(|w| task.assigned_worker.as_deref() == Some(w))
                .unwrap_or(true)
    }
}

/// Outcome of a [`TaskTable::cancel`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was PENDING/QUEUED and is now CANCELLED immediately.
    CancelledImmediately,
    /// The task was RUNNING; a cancel signal should be sent to the worker
    /// and the task finalized by the Completion Pipeline when it reports.
    CancelRequested,
}

/// Outcome of a [`TaskTable::try_complete`] call.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// The report matched a RUNNING task assigned to the reporting worker;
    /// the transition was applied.
    Applied(Task),
    /// The task was not RUNNING, or was assigned to a different worker —
    /// a stale or duplicate report (§4.5 step 1, §8 scenario 4).
    Stale,
}

/// The in-memory Task Table.
pub struct TaskTable {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a freshly submitted task in QUEUED status. The caller is
    /// responsible for having already validated PENDING -> QUEUED via
    /// [`TaskStateMachine`] and for pushing the id onto the queue.
    pub fn insert_queued(&self, task: Task) {
        debug_assert_eq!(task.status, TaskStatus::Queued);
        let mut tasks = self.tasks.lock().expect("task table lock poisoned");
        tasks.insert(task.task_id, task);
    }

    pub fn get(&self, task_id: Uuid) -> Option<Task> {
        self.tasks
            .lock()
            .expect("task table lock poisoned")
            .get(&task_id)
            .cloned()
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        self.tasks
            .lock()
            .expect("task table lock poisoned")
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect()
    }

    /// QUEUED -> RUNNING, applied atomically with the assignment fields
    /// (§4.4 step e). Fails if the task is missing or no longer QUEUED —
    /// the double-wakeup race the Dispatcher is documented to tolerate.
    pub fn try_dispatch(
        &self,
        task_id: Uuid,
        worker_id: &str,
        started_at: DateTime<Utc>,
        load_at_assignment: ResourceVector,
        reservation_id: Uuid,
    ) -> Result<Task, CoreError> {
        let mut tasks = self.tasks.lock().expect("task table lock poisoned");
        let task = tasks
            .get_mut(&task_id)
            .ok_or(CoreError::TaskNotFound(task_id))?;

        if !TaskStateMachine::is_valid_transition(task.status, TaskStatus::Running) {
            return Err(CoreError::InvalidTransition {
                task_id,
                from: "non-queued",
                to: "running",
            });
        }

        task.status = TaskStatus::Running;
        task.assigned_worker = Some(worker_id.to_owned());
        task.started_at = Some(started_at);
        task.load_at_assignment = Some(load_at_assignment);
        task.reservation_id = Some(reservation_id);
        Ok(task.clone())
    }

    /// `Cancel(task_id)` (§4.3).
    pub fn cancel(&self, task_id: Uuid) -> Result<CancelOutcome, CoreError> {
        let mut tasks = self.tasks.lock().expect("task table lock poisoned");
        let task = tasks
            .get_mut(&task_id)
            .ok_or(CoreError::TaskNotFound(task_id))?;

        match task.status {
            TaskStatus::Pending | TaskStatus::Queued => {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                Ok(CancelOutcome::CancelledImmediately)
            }
            TaskStatus::Running => Ok(CancelOutcome::CancelRequested),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                Err(CoreError::AlreadyTerminal(task_id))
            }
        }
    }

    /// Apply a completion report (§4.5 steps 1, 5, 6). Validates RUNNING +
    /// matching `assigned_worker` inside the lock (§5).
    pub fn try_complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        to: TaskStatus,
        finished_at: DateTime<Utc>,
        sla_met: Option<bool>,
    ) -> Result<CompletionOutcome, CoreError> {
        debug_assert!(to.is_terminal());
        let mut tasks = self.tasks.lock().expect("task table lock poisoned");
        let task = tasks
            .get_mut(&task_id)
            .ok_or(CoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Running || task.assigned_worker.as_deref() != Some(worker_id)
        {
            return Ok(CompletionOutcome::Stale);
        }

        task.status = to;
        task.completed_at = Some(finished_at);
        task.sla_met = sla_met;
        task.reservation_id = None;
        Ok(CompletionOutcome::Applied(task.clone()))
    }

    /// RUNNING -> FAILED with an implicit RESERVATION_EXPIRED reason, used
    /// by the reservation sweeper (§4.2 `SweepExpiredReservations`, §4.8).
    pub fn fail_reservation_expired(&self, task_id: Uuid) -> Result<Option<Task>, CoreError> {
        let mut tasks = self.tasks.lock().expect("task table lock poisoned");
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Running {
            return Ok(None);
        }
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.sla_met = Some(false);
        task.reservation_id = None;
        Ok(Some(task.clone()))
    }

    /// Startup rehydration (§4.7): replace the table wholesale with rows
    /// loaded from storage. Non-terminal RUNNING tasks should already have
    /// been reset to QUEUED with recomputed deadlines by the caller before
    /// this is invoked.
    pub fn rehydrate(&self, tasks: Vec<Task>) {
        let mut table = self.tasks.lock().expect("task table lock poisoned");
        table.clear();
        for task in tasks {
            table.insert(task.task_id, task);
        }
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
