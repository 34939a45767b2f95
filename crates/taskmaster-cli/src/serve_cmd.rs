//! `taskmaster serve`: run the Master loop to completion.
//!
//! Bootstraps [`taskmaster_core::Core`] against the configured database,
//! spawns its background loops (Dispatcher, Reconnection Monitor,
//! sweepers), and blocks until interrupted. No HTTP/WebSocket surface is
//! exposed here — the outer RPC transport workers and operators talk to is
//! out of scope for this binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use taskmaster_core::rpc::OutboundSender;
use taskmaster_core::{Core, CoreConfig, PersistenceAdapter, PostgresPersistence, WorkerConnector};
use taskmaster_db::config::DbConfig;

/// Stand-in [`WorkerConnector`] used until a concrete worker transport is
/// wired up. Every probe fails, so the Reconnection Monitor just logs and
/// keeps workers inactive until they heartbeat back in on their own.
struct UnimplementedConnector;

#[async_trait]
impl WorkerConnector for UnimplementedConnector {
    async fn connect(
        &self,
        _worker_id: &str,
        _address: &str,
        _capacity: usize,
        _timeout: Duration,
    ) -> Result<OutboundSender> {
        anyhow::bail!("no worker transport is wired up in this build")
    }
}

/// Connect to the database and bootstrap a [`Core`] against it (§4.7
/// rehydration). Shared by `serve` and by the one-shot operator commands
/// (`submit`, `cancel`) that exercise the engine without keeping its
/// background loops running.
pub async fn bootstrap_core(db_config: &DbConfig, core_config: CoreConfig) -> Result<Arc<Core>> {
    let pool = taskmaster_db::pool::create_pool(db_config).await?;
    taskmaster_db::pool::run_migrations(&pool).await?;

    let persistence: Arc<dyn PersistenceAdapter> = Arc::new(PostgresPersistence::new(pool));
    let connector: Arc<dyn WorkerConnector> = Arc::new(UnimplementedConnector);
    let core = Arc::new(Core::new(persistence, connector, core_config));

    core.bootstrap().await.context("failed to bootstrap orchestration core")?;
    Ok(core)
}

pub async fn run_serve(db_config: DbConfig, core_config: CoreConfig) -> Result<()> {
    let core = bootstrap_core(&db_config, core_config).await?;
    tracing::info!("master bootstrapped, starting background loops");

    let handles = core.spawn_background_tasks();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    core.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("master shut down cleanly");
    Ok(())
}
