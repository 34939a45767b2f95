//! Reconnection Monitor (§4.6): periodically probes inactive workers and
//! re-establishes their outbound dispatch streams.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::registry::WorkerRegistry;
use crate::rpc::WorkerConnector;

/// Probes every inactive worker on a fixed interval, each probe running
/// independently so a slow one does not delay the rest (§4.6).
pub struct ReconnectionMonitor {
    registry: Arc<WorkerRegistry>,
    connector: Arc<dyn WorkerConnector>,
    config: CoreConfig,
}

impl ReconnectionMonitor {
    pub fn new(registry: Arc<WorkerRegistry>, connector: Arc<dyn WorkerConnector>, config: CoreConfig) -> Self {
        Self {
            registry,
            connector,
            config,
        }
    }

    /// Run until `cancel` fires. Shuts down deterministically: in-flight
    /// probes are drained before the loop exits (§4.6, §5).
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconnect_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("reconnection monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
    }

    /// One sweep: probe every currently-inactive worker concurrently.
    pub async fn probe_once(&self) {
        let inactive: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|w| !w.is_active)
            .collect();
        if inactive.is_empty() {
            return;
        }

        let mut probes = tokio::task::JoinSet::new();
        for worker in inactive {
            let registry = Arc::clone(&self.registry);
            let connector = Arc::clone(&self.connector);
            let capacity = self.config.dispatch_channel_capacity;
            let timeout = self.config.reconnect_probe_timeout;
            probes.spawn(async move {
                // The monitor enforces the deadline itself rather than trusting
                // the connector to honor `timeout`, so a hung transport can't
                // block the join-drain below and defer shutdown (§5).
                match tokio::time::timeout(
                    timeout,
                    connector.connect(&worker.worker_id, &worker.address, capacity, timeout),
                )
                .await
                {
                    Ok(Ok(sender)) => {
                        if registry
                            .set_outbound_and_activate(&worker.worker_id, sender)
                            .is_ok()
                        {
                            tracing::info!(worker_id = %worker.worker_id, "worker reconnected");
                        }
                    }
                    Ok(Err(err)) => {
                        // Silent after the initial registration log, to avoid
                        // spamming every interval while a worker stays down (§4.6).
                        tracing::debug!(worker_id = %worker.worker_id, error = %err, "reconnection probe failed");
                    }
                    Err(_) => {
                        tracing::debug!(worker_id = %worker.worker_id, "reconnection probe timed out");
                    }
                }
            });
        }
        while probes.join_next().await.is_some() {}
    }
}
