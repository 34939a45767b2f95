//! In-memory EMA runtime estimator, keyed by workload fingerprint (§4.1).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single fingerprint's learned runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TauEntry {
    pub tau_seconds: f64,
    pub samples: u64,
    pub last_updated: DateTime<Utc>,
}

/// Result of a [`TauStore::get`] lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TauEstimate {
    pub tau: Duration,
    /// 0.0 when the fingerprint has never been observed, 1.0 otherwise.
    pub confidence: f64,
}

/// EMA-smoothed per-workload runtime estimator.
///
/// A single writer lock guards the whole map; contention is minimal since
/// updates only happen on task completion (§5).
pub struct TauStore {
    lambda: f64,
    entries: RwLock<HashMap<String, TauEntry>>,
}

impl TauStore {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// `Get(fp) -> (tau, confidence)`. Returns `default` with confidence 0
    /// when the fingerprint is unknown.
    pub fn get(&self, fingerprint: &str, default: Duration) -> TauEstimate {
        let entries = self.entries.read().expect("tau store lock poisoned");
        match entries.get(fingerprint) {
            Some(entry) => TauEstimate {
                tau: Duration::from_secs_f64(entry.tau_seconds.max(0.0)),
                confidence: 1.0,
            },
            None => TauEstimate {
                tau: default,
                confidence: 0.0,
            },
        }
    }

    /// `Update(fp, observed)`: `tau_new = λ·observed + (1−λ)·tau_old`; the
    /// first sample for a fingerprint sets `tau_new = observed` directly.
    pub fn update(&self, fingerprint: &str, observed: Duration) {
        let observed_secs = observed.as_secs_f64();
        let mut entries = self.entries.write().expect("tau store lock poisoned");
        entries
            .entry(fingerprint.to_owned())
            .and_modify(|entry| {
                entry.tau_seconds = self.lambda * observed_secs + (1.0 - self.lambda) * entry.tau_seconds;
                entry.samples += 1;
                entry.last_updated = Utc::now();
            })
            .or_insert_with(|| TauEntry {
                tau_seconds: observed_secs,
                samples: 1,
                last_updated: Utc::now(),
            });
    }

    /// Deep-copy snapshot of every known fingerprint's state, for durability.
    pub fn snapshot(&self) -> HashMap<String, TauEntry> {
        self.entries.read().expect("tau store lock poisoned").clone()
    }

    /// Replace the in-memory map wholesale (used on startup rehydration).
    pub fn restore(&self, snapshot: HashMap<String, TauEntry>) {
        let mut entries = self.entries.write().expect("tau store lock poisoned");
        *entries = snapshot;
    }
}
