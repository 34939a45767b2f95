//! Tunables for the orchestration core (§6: "Configuration").

use std::env;
use std::time::Duration;

/// Configuration for a running [`crate::core::Core`].
///
/// Every field has a documented default matching §6 of the orchestration
/// design; all can be overridden via `TASKMASTER_*` environment variables
/// through [`CoreConfig::from_env`].
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// EMA smoothing factor for the Tau Store.
    pub tau_lambda: f64,
    /// Deadline slack multiplier applied to the estimated runtime.
    pub deadline_slack_k: f64,
    /// Deadline floor used when no runtime estimate exists yet.
    pub tau_floor: Duration,
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval: Duration,
    /// A worker is considered stale once its last heartbeat is older than this.
    pub worker_stale_timeout: Duration,
    /// Interval between Reconnection Monitor sweeps.
    pub reconnect_interval: Duration,
    /// Per-probe timeout used by the Reconnection Monitor.
    pub reconnect_probe_timeout: Duration,
    /// Interval between Dispatcher wakeup ticks.
    pub dispatcher_tick: Duration,
    /// Reservation TTL is `tau * reservation_ttl_multiplier`, clamped below.
    pub reservation_ttl_multiplier: f64,
    /// Minimum reservation TTL regardless of the multiplier above.
    pub reservation_ttl_floor: Duration,
    /// Capacity of each worker's outbound dispatch channel.
    pub dispatch_channel_capacity: usize,
}

impl CoreConfig {
    /// Build a config from `TASKMASTER_*` environment variables, falling
    /// back to the documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tau_lambda: env_f64("TASKMASTER_TAU_LAMBDA", defaults.tau_lambda),
            deadline_slack_k: env_f64("TASKMASTER_DEADLINE_SLACK_K", defaults.deadline_slack_k),
            tau_floor: env_secs("TASKMASTER_TAU_FLOOR_SECONDS", defaults.tau_floor),
            heartbeat_interval: env_secs(
                "TASKMASTER_HEARTBEAT_INTERVAL_S",
                defaults.heartbeat_interval,
            ),
            worker_stale_timeout: env_secs(
                "TASKMASTER_WORKER_STALE_TIMEOUT_S",
                defaults.worker_stale_timeout,
            ),
            reconnect_interval: env_secs(
                "TASKMASTER_RECONNECT_INTERVAL_S",
                defaults.reconnect_interval,
            ),
            reconnect_probe_timeout: env_secs(
                "TASKMASTER_RECONNECT_PROBE_TIMEOUT_S",
                defaults.reconnect_probe_timeout,
            ),
            dispatcher_tick: env_millis("TASKMASTER_DISPATCHER_TICK_MS", defaults.dispatcher_tick),
            reservation_ttl_multiplier: env_f64(
                "TASKMASTER_RESERVATION_TTL_MULTIPLIER",
                defaults.reservation_ttl_multiplier,
            ),
            reservation_ttl_floor: defaults.reservation_ttl_floor,
            dispatch_channel_capacity: env_usize(
                "TASKMASTER_DISPATCH_CHANNEL_CAPACITY",
                defaults.dispatch_channel_capacity,
            ),
        }
    }

    /// Compute the reservation TTL for an estimated runtime, clamped to the
    /// configured floor (§4.4: `ttl = max(τ·3, 60s)`).
    pub fn reservation_ttl(&self, tau: Duration) -> Duration {
        let scaled = tau.mul_f64(self.reservation_ttl_multiplier);
        scaled.max(self.reservation_ttl_floor)
    }

    /// Compute a task's deadline offset from its submission time
    /// (§4.3: `deadline = created_at + max(τ·K, τ_floor)`).
    pub fn deadline_offset(&self, tau: Duration, confidence: f64) -> Duration {
        if confidence <= 0.0 {
            return self.tau_floor;
        }
        tau.mul_f64(self.deadline_slack_k).max(self.tau_floor)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tau_lambda: 0.2,
            deadline_slack_k: 1.5,
            tau_floor: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            worker_stale_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(30),
            reconnect_probe_timeout: Duration::from_secs(3),
            dispatcher_tick: Duration::from_millis(500),
            reservation_ttl_multiplier: 3.0,
            reservation_ttl_floor: Duration::from_secs(60),
            dispatch_channel_capacity: 64,
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
