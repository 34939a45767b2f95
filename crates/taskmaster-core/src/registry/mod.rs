//! Worker Registry (§4.2): the authoritative in-memory view of every known
//! worker, with atomic reservation-based resource accounting.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::CoreError;
use crate::rpc::{OutboundMessage, OutboundSender, Telemetry};

/// A `{cpu, memory, storage, gpu}` quantity: capacity, allocation, or a
/// request, depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceVector {
    pub cpu: f64,
    pub memory: f64,
    pub storage: f64,
    pub gpu: f64,
}

impl ResourceVector {
    pub const ZERO: Self = Self {
        cpu: 0.0,
        memory: 0.0,
        storage: 0.0,
        gpu: 0.0,
    };

    pub fn new(cpu: f64, memory: f64, storage: f64, gpu: f64) -> Self {
        Self {
            cpu,
            memory,
            storage,
            gpu,
        }
    }

    fn add(self, other: Self) -> Self {
        Self {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
            storage: self.storage + other.storage,
            gpu: self.gpu + other.gpu,
        }
    }

    fn sub(self, other: Self) -> Self {
        Self {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: (self.memory - other.memory).max(0.0),
            storage: (self.storage - other.storage).max(0.0),
            gpu: (self.gpu - other.gpu).max(0.0),
        }
    }

    /// True if every component of `self` is at least `required`'s.
    fn covers(self, required: Self) -> bool {
        self.cpu >= required.cpu
            && self.memory >= required.memory
            && self.storage >= required.storage
            && self.gpu >= required.gpu
    }
}

/// Events emitted by the registry, staged and published after the writer
/// lock is released so subscribers never re-enter the registry while it's
/// held (§9).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added { worker_id: String },
    Updated { worker_id: String },
    Removed { worker_id: String },
    Reserved { worker_id: String, task_id: Uuid, reservation_id: Uuid },
    Released { worker_id: String, task_id: Uuid, reservation_id: Uuid },
}

struct WorkerState {
    address: String,
    total: ResourceVector,
    allocated: ResourceVector,
    reported: Option<ResourceVector>,
    is_active: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    reservation_ids: Vec<Uuid>,
    outbound: Option<OutboundSender>,
}

struct ReservationState {
    task_id: Uuid,
    worker_id: String,
    reserved: ResourceVector,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Deep-copied, lock-free view of a worker, safe to hold across awaits.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub worker_id: String,
    pub address: String,
    pub total: ResourceVector,
    pub allocated: ResourceVector,
    pub is_active: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub has_outbound: bool,
}

impl WorkerView {
    pub fn available(&self) -> ResourceVector {
        self.total.sub(self.allocated)
    }

    pub fn fits(&self, required: ResourceVector) -> bool {
        self.available().covers(required)
    }

    /// CPU utilization ratio, used as the least-loaded tie-break (§4.2).
    /// A worker with zero total CPU is treated as fully loaded.
    pub fn cpu_utilization(&self) -> f64 {
        if self.total.cpu <= 0.0 {
            1.0
        } else {
            self.allocated.cpu / self.total.cpu
        }
    }
}

/// A live reservation, surfaced to callers that need the snapshot (e.g.
/// the sweeper, tests).
#[derive(Debug, Clone)]
pub struct ReservationView {
    pub reservation_id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub reserved: ResourceVector,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A reservation that the sweeper reclaimed because it outlived its TTL.
#[derive(Debug, Clone)]
pub struct ExpiredReservation {
    pub reservation_id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
}

struct RegistryState {
    workers: HashMap<String, WorkerState>,
    reservations: HashMap<Uuid, ReservationState>,
}

/// Authoritative in-memory worker state.
///
/// The worker map and allocated counters share a single reader-writer
/// mutex (§5): every reserve/release/heartbeat/register takes the writer
/// lock, and the check-and-deduct in [`WorkerRegistry::reserve`] is one
/// critical section. Snapshots take the reader lock and deep-copy, so
/// callers never hold the lock across an await point.
pub struct WorkerRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(RegistryState {
                workers: HashMap::new(),
                reservations: HashMap::new(),
            }),
            events,
        }
    }

    fn publish(&self, event: RegistryEvent) {
        // No receivers is the common case when nothing is subscribed yet;
        // a dropped event here is fine, matching the documented
        // non-blocking delivery semantics (§4.2).
        let _ = self.events.send(event);
    }

    /// `Subscribe() -> stream of registry events` (§4.2). Slow subscribers
    /// miss events rather than blocking publishers; callers that care can
    /// detect lag via `RecvError::Lagged` and fall back to `snapshot()`.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// `UpsertOnRegister(id, addr, capacities)` (§4.2). Idempotent for a
    /// matching address; rejects an address change for an existing id, and
    /// rejects shrinking capacity below what's currently allocated
    /// (open question (a), resolved as CAPACITY_UNDERFLOW — see DESIGN.md).
    pub fn upsert_on_register(
        &self,
        worker_id: &str,
        address: &str,
        total: ResourceVector,
        outbound: Option<OutboundSender>,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let mut state = self.state.write().expect("registry lock poisoned");

        let event = match state.workers.get_mut(worker_id) {
            Some(existing) => {
                if existing.address != address {
                    return Err(CoreError::AlreadyExists {
                        worker_id: worker_id.to_owned(),
                        existing: existing.address.clone(),
                        requested: address.to_owned(),
                    });
                }
                if !total.covers(existing.allocated) {
                    return Err(CoreError::CapacityUnderflow {
                        worker_id: worker_id.to_owned(),
                    });
                }
                existing.total = total;
                existing.updated_at = now;
                if outbound.is_some() {
                    existing.outbound = outbound;
                }
                RegistryEvent::Updated {
                    worker_id: worker_id.to_owned(),
                }
            }
            None => {
                state.workers.insert(
                    worker_id.to_owned(),
                    WorkerState {
                        address: address.to_owned(),
                        total,
                        allocated: ResourceVector::ZERO,
                        reported: None,
                        is_active: false,
                        last_heartbeat: None,
                        registered_at: now,
                        updated_at: now,
                        reservation_ids: Vec::new(),
                        outbound,
                    },
                );
                RegistryEvent::Added {
                    worker_id: worker_id.to_owned(),
                }
            }
        };
        drop(state);
        self.publish(event);
        Ok(())
    }

    /// Explicit unregistration: the only way a worker is destroyed (§3).
    pub fn unregister(&self, worker_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        if state.workers.remove(worker_id).is_none() {
            return Err(CoreError::WorkerNotFound(worker_id.to_owned()));
        }
        drop(state);
        self.publish(RegistryEvent::Removed {
            worker_id: worker_id.to_owned(),
        });
        Ok(())
    }

    /// `Heartbeat(id, telemetry)` (§4.2). Updates liveness and the
    /// worker-reported usage vector, which is informational only and
    /// never substitutes for `allocated_x`.
    pub fn heartbeat(&self, worker_id: &str, telemetry: &Telemetry) -> Result<(), CoreError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_owned()))?;
        worker.last_heartbeat = Some(telemetry.ts);
        worker.is_active = true;
        worker.updated_at = Utc::now();
        worker.reported = Some(ResourceVector::new(
            telemetry.cpu_pct,
            telemetry.memory_pct,
            0.0,
            telemetry.gpu_pct,
        ));
        drop(state);
        self.publish(RegistryEvent::Updated {
            worker_id: worker_id.to_owned(),
        });
        Ok(())
    }

    /// `Reserve(task_id, worker_id, req, ttl) -> reservation_id` (§4.2).
    /// Check-and-deduct is one critical section under the writer lock.
    pub fn reserve(
        &self,
        task_id: Uuid,
        worker_id: &str,
        req: ResourceVector,
        ttl: Duration,
    ) -> Result<Uuid, CoreError> {
        let now = Utc::now();
        let mut state = self.state.write().expect("registry lock poisoned");
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_owned()))?;

        let available = worker.total.sub(worker.allocated);
        if !available.covers(req) {
            return Err(CoreError::InsufficientResources {
                worker_id: worker_id.to_owned(),
            });
        }

        worker.allocated = worker.allocated.add(req);
        worker.updated_at = now;
        let reservation_id = Uuid::new_v4();
        worker.reservation_ids.push(reservation_id);

        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        state.reservations.insert(
            reservation_id,
            ReservationState {
                task_id,
                worker_id: worker_id.to_owned(),
                reserved: req,
                created_at: now,
                expires_at,
            },
        );

        drop(state);
        self.publish(RegistryEvent::Reserved {
            worker_id: worker_id.to_owned(),
            task_id,
            reservation_id,
        });
        Ok(reservation_id)
    }

    /// `Release(reservation_id)` (§4.2). Idempotent: releasing an unknown
    /// (already-released) id is a no-op that returns `AlreadyReleased`
    /// rather than panicking or erroring loudly.
    pub fn release(&self, reservation_id: Uuid) -> Result<(), CoreError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        let Some(reservation) = state.reservations.remove(&reservation_id) else {
            return Err(CoreError::AlreadyReleased(reservation_id));
        };

        if let Some(worker) = state.workers.get_mut(&reservation.worker_id) {
            worker.allocated = worker.allocated.sub(reservation.reserved);
            worker.updated_at = Utc::now();
            worker.reservation_ids.retain(|id| *id != reservation_id);
        }

        drop(state);
        self.publish(RegistryEvent::Released {
            worker_id: reservation.worker_id,
            task_id: reservation.task_id,
            reservation_id,
        });
        Ok(())
    }

    /// `Snapshot() -> []WorkerView` (§4.2). Deep-copied, usable without
    /// further locking.
    pub fn snapshot(&self) -> Vec<WorkerView> {
        let state = self.state.read().expect("registry lock poisoned");
        state
            .workers
            .iter()
            .map(|(worker_id, worker)| WorkerView {
                worker_id: worker_id.clone(),
                address: worker.address.clone(),
                total: worker.total,
                allocated: worker.allocated,
                is_active: worker.is_active,
                last_heartbeat: worker.last_heartbeat,
                registered_at: worker.registered_at,
                updated_at: worker.updated_at,
                has_outbound: worker.outbound.is_some(),
            })
            .collect()
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerView> {
        let state = self.state.read().expect("registry lock poisoned");
        state.workers.get(worker_id).map(|worker| WorkerView {
            worker_id: worker_id.to_owned(),
            address: worker.address.clone(),
            total: worker.total,
            allocated: worker.allocated,
            is_active: worker.is_active,
            last_heartbeat: worker.last_heartbeat,
            registered_at: worker.registered_at,
            updated_at: worker.updated_at,
            has_outbound: worker.outbound.is_some(),
        })
    }

    /// Best-effort, non-blocking push onto a worker's outbound channel.
    /// A full or missing channel surfaces as `Unavailable`, which the
    /// Dispatcher treats as "try the next worker" (§5).
    pub fn try_dispatch(&self, worker_id: &str, message: OutboundMessage) -> Result<(), CoreError> {
        let sender = {
            let state = self.state.read().expect("registry lock poisoned");
            let worker = state
                .workers
                .get(worker_id)
                .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_owned()))?;
            worker
                .outbound
                .clone()
                .ok_or_else(|| CoreError::Unavailable {
                    worker_id: worker_id.to_owned(),
                })?
        };
        sender
            .try_send(message)
            .map_err(|_| CoreError::Unavailable {
                worker_id: worker_id.to_owned(),
            })
    }

    /// Re-establish (or replace) a worker's outbound channel and mark it
    /// active, used by the Reconnection Monitor on a successful probe.
    pub fn set_outbound_and_activate(&self, worker_id: &str, sender: OutboundSender) -> Result<(), CoreError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::WorkerNotFound(worker_id.to_owned()))?;
        worker.outbound = Some(sender);
        worker.is_active = true;
        worker.updated_at = Utc::now();
        drop(state);
        self.publish(RegistryEvent::Updated {
            worker_id: worker_id.to_owned(),
        });
        Ok(())
    }

    /// `SweepStale(timeout)` (§4.2). Marks workers inactive when their last
    /// heartbeat (or registration, if none has arrived yet) is older than
    /// `timeout`. Never releases reservations — those belong to tasks.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let mut went_stale = Vec::new();

        let mut state = self.state.write().expect("registry lock poisoned");
        for (worker_id, worker) in state.workers.iter_mut() {
            if !worker.is_active {
                continue;
            }
            let last_seen = worker.last_heartbeat.unwrap_or(worker.registered_at);
            if now - last_seen > threshold {
                worker.is_active = false;
                worker.updated_at = now;
                went_stale.push(worker_id.clone());
            }
        }
        drop(state);
        for worker_id in &went_stale {
            self.publish(RegistryEvent::Updated {
                worker_id: worker_id.clone(),
            });
        }
        went_stale
    }

    /// `SweepExpiredReservations(now)` (§4.2). Releases any reservation
    /// past its TTL and returns the list so the caller can fail the owning
    /// task with `RESERVATION_EXPIRED`.
    pub fn sweep_expired_reservations(&self, now: DateTime<Utc>) -> Vec<ExpiredReservation> {
        let mut state = self.state.write().expect("registry lock poisoned");
        let expired_ids: Vec<Uuid> = state
            .reservations
            .iter()
            .filter(|(_, reservation)| reservation.expires_at < now)
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for reservation_id in expired_ids {
            let Some(reservation) = state.reservations.remove(&reservation_id) else {
                continue;
            };
            if let Some(worker) = state.workers.get_mut(&reservation.worker_id) {
                worker.allocated = worker.allocated.sub(reservation.reserved);
                worker.updated_at = now;
                worker.reservation_ids.retain(|id| *id != reservation_id);
            }
            expired.push(ExpiredReservation {
                reservation_id,
                task_id: reservation.task_id,
                worker_id: reservation.worker_id,
            });
        }
        drop(state);
        for item in &expired {
            self.publish(RegistryEvent::Released {
                worker_id: item.worker_id.clone(),
                task_id: item.task_id,
                reservation_id: item.reservation_id,
            });
        }
        expired
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rv(cpu: f64, mem: f64) -> ResourceVector {
        ResourceVector::new(cpu, mem, 0.0, 0.0)
    }

    #[test]
    fn register_then_snapshot() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].worker_id, "w1");
        assert_eq!(snap[0].available(), rv(8.0, 16.0));
    }

    #[test]
    fn re_register_same_address_overwrites_capacity() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        registry
            .upsert_on_register("w1", "addr1", rv(4.0, 8.0), None)
            .unwrap();
        let view = registry.get("w1").unwrap();
        assert_eq!(view.total, rv(4.0, 8.0));
    }

    #[test]
    fn re_register_conflicting_address_rejected() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        let err = registry
            .upsert_on_register("w1", "addr2", rv(8.0, 16.0), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists { .. }));
    }

    #[test]
    fn reserve_below_allocated_capacity_rejected() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        registry
            .reserve(Uuid::new_v4(), "w1", rv(4.0, 4.0), Duration::from_secs(60))
            .unwrap();
        let err = registry
            .upsert_on_register("w1", "addr1", rv(2.0, 16.0), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::CapacityUnderflow { .. }));
    }

    #[test]
    fn reserve_and_release_round_trip() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        let id = registry
            .reserve(Uuid::new_v4(), "w1", rv(2.0, 4.0), Duration::from_secs(60))
            .unwrap();
        assert_eq!(registry.get("w1").unwrap().allocated, rv(2.0, 4.0));

        registry.release(id).unwrap();
        assert_eq!(registry.get("w1").unwrap().allocated, rv(0.0, 0.0));
    }

    #[test]
    fn release_is_idempotent() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        let id = registry
            .reserve(Uuid::new_v4(), "w1", rv(2.0, 4.0), Duration::from_secs(60))
            .unwrap();
        registry.release(id).unwrap();
        let err = registry.release(id).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyReleased(_)));
        assert_eq!(registry.get("w1").unwrap().allocated, rv(0.0, 0.0));
    }

    #[test]
    fn reserve_insufficient_resources() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(2.0, 4.0), None)
            .unwrap();
        let err = registry
            .reserve(Uuid::new_v4(), "w1", rv(4.0, 4.0), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientResources { .. }));
    }

    #[test]
    fn heartbeat_marks_active_and_unknown_worker_errors() {
        let registry = WorkerRegistry::new();
        let telemetry = Telemetry {
            cpu_pct: 0.5,
            memory_pct: 0.2,
            gpu_pct: 0.0,
            running_task_ids: vec![],
            ts: Utc::now(),
        };
        assert!(registry.heartbeat("ghost", &telemetry).is_err());

        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        registry.heartbeat("w1", &telemetry).unwrap();
        assert!(registry.get("w1").unwrap().is_active);
    }

    #[test]
    fn sweep_stale_marks_inactive_without_touching_reservations() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        let telemetry = Telemetry {
            cpu_pct: 0.0,
            memory_pct: 0.0,
            gpu_pct: 0.0,
            running_task_ids: vec![],
            ts: Utc::now() - chrono::Duration::seconds(120),
        };
        registry.heartbeat("w1", &telemetry).unwrap();
        let id = registry
            .reserve(Uuid::new_v4(), "w1", rv(2.0, 4.0), Duration::from_secs(600))
            .unwrap();

        let went_stale = registry.sweep_stale(Duration::from_secs(30));
        assert_eq!(went_stale, vec!["w1".to_string()]);
        assert!(!registry.get("w1").unwrap().is_active);
        // Reservation is untouched by the stale sweep.
        assert_eq!(registry.get("w1").unwrap().allocated, rv(2.0, 4.0));
        registry.release(id).unwrap();
    }

    #[test]
    fn sweep_expired_reservations_releases_and_reports() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("w1", "addr1", rv(8.0, 16.0), None)
            .unwrap();
        let task_id = Uuid::new_v4();
        registry
            .reserve(task_id, "w1", rv(2.0, 4.0), Duration::from_secs(0))
            .unwrap();

        let expired = registry.sweep_expired_reservations(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id, task_id);
        assert_eq!(registry.get("w1").unwrap().allocated, rv(0.0, 0.0));
    }

    #[test]
    fn least_loaded_tie_break_is_cpu_utilization_then_id() {
        let registry = WorkerRegistry::new();
        registry
            .upsert_on_register("b", "addr-b", rv(10.0, 10.0), None)
            .unwrap();
        registry
            .upsert_on_register("a", "addr-a", rv(10.0, 10.0), None)
            .unwrap();
        registry
            .reserve(Uuid::new_v4(), "b", rv(5.0, 0.0), Duration::from_secs(60))
            .unwrap();

        let mut snap = registry.snapshot();
        snap.sort_by(|x, y| {
            x.cpu_utilization()
                .partial_cmp(&y.cpu_utilization())
                .unwrap()
                .then_with(|| x.worker_id.cmp(&y.worker_id))
        });
        assert_eq!(snap[0].worker_id, "a");
    }
}
