use crate::engine::OrderSyncEngine;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Graceful shutdown coordinator for the sync engine
pub struct ShutdownCoordinator {
    engine: Arc<OrderSyncEngine>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(engine: Arc<OrderSyncEngine>, grace: Duration) -> Self {
        Self { engine, grace }
    }

    /// Wait for Ctrl-C, then stop every tracking task
    pub async fn wait_for_shutdown(self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on Ctrl-C");
        wait_for_shutdown_signal().await?;
        self.shutdown().await;
        Ok(())
    }

    /// Stop tracking within the grace period
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of order tracking...");

        let tracked = self.engine.reconciler().tracked_ids().len();
        // The reconciler bounds its own join; the outer timeout covers the
        // case where the runtime is starved.
        if timeout(self.grace * 2, self.engine.shutdown(self.grace)).await.is_err() {
            warn!(tracked = tracked, "Tracking shutdown did not finish in time");
            return;
        }

        info!(tracked = tracked, "Graceful shutdown completed successfully");
    }
}

/// Resolves on the first Ctrl-C
pub async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}
