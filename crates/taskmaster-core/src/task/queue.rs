//! The pending queue: deadline-ordered, independent of the Task Table's
//! lock (§5).

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Ordering key: deadline ascending, ties broken by `created_at` then
/// `task_id` (§4.3). Field declaration order drives the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    deadline: DateTime<Utc>,
    created_at: DateTime<Utc>,
    task_id: Uuid,
}

struct QueueState {
    ordered: BTreeSet<QueueKey>,
    index: HashMap<Uuid, QueueKey>,
    /// First time a dispatch pass found no worker that fit a queued task.
    /// Cleared when the task leaves the queue (dispatched or cancelled).
    unfulfillable_since: HashMap<Uuid, DateTime<Utc>>,
}

/// Queue-wide unschedulability summary (§7: "unschedulable duration" must be
/// observable for queued tasks that fit no worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueHealth {
    pub queued: usize,
    pub unfulfillable: usize,
    pub longest_unfulfillable: Option<chrono::Duration>,
}

/// The pending-task queue, ordered by deadline (§4.3).
///
/// Guarded by its own mutex, independent of the Task Table's. Callers that
/// need both must take the Task Table lock first (§5).
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ordered: BTreeSet::new(),
                index: HashMap::new(),
                unfulfillable_since: HashMap::new(),
            }),
        }
    }

    /// Enqueue a task. `deadline` defaults to the far future if the task
    /// has none, so undeadlined tasks sort last rather than first.
    pub fn push(&self, task_id: Uuid, deadline: Option<DateTime<Utc>>, created_at: DateTime<Utc>) {
        let key = QueueKey {
            deadline: deadline.unwrap_or(DateTime::<Utc>::MAX_UTC),
            created_at,
            task_id,
        };
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.ordered.insert(key);
        state.index.insert(task_id, key);
        state.unfulfillable_since.remove(&task_id);
    }

    /// Remove a task from the queue if present. Returns whether it was
    /// found (a dispatcher race may have already removed it).
    pub fn remove(&self, task_id: Uuid) -> bool {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.unfulfillable_since.remove(&task_id);
        if let Some(key) = state.index.remove(&task_id) {
            state.ordered.remove(&key);
            true
        } else {
            false
        }
    }

    /// Record that a dispatch pass found no worker fitting this queued
    /// task. A no-op if the task already has an earlier mark or has left
    /// the queue.
    pub fn mark_unfulfillable(&self, task_id: Uuid, at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.index.contains_key(&task_id) {
            state.unfulfillable_since.entry(task_id).or_insert(at);
        }
    }

    /// Summarize unschedulability across the whole queue (§7).
    pub fn health(&self, now: DateTime<Utc>) -> QueueHealth {
        let state = self.state.lock().expect("queue lock poisoned");
        let longest = state
            .unfulfillable_since
            .values()
            .map(|since| now - *since)
            .max();
        QueueHealth {
            queued: state.ordered.len(),
            unfulfillable: state.unfulfillable_since.len(),
            longest_unfulfillable: longest,
        }
    }

    /// Non-destructive ordered peek of every queued task id (§4.4 step 1:
    /// "Snapshot the queue (peek, do not dequeue)").
    pub fn snapshot(&self) -> Vec<Uuid> {
        let state = self.state.lock().expect("queue lock poisoned");
        state.ordered.iter().map(|key| key.task_id).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
