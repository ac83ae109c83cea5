//! Coordinated teardown of the relay server.
//!
//! One root shutdown signal is shared by the accept loop and every
//! connection. The coordinator fires it, then disposes every registered
//! handle with bounded concurrency and a bounded per-handle join timeout.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;

use crate::config::ShutdownConfig;
use crate::connection::ConnectionRegistry;

/// Handles teardown of all registered connections
pub struct ShutdownCoordinator {
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    config: ShutdownConfig,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        shutdown_tx: watch::Sender<bool>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence
    ///
    /// Returns a ShutdownResult with details about the teardown
    #[tracing::instrument(
        name = "relay_shutdown",
        skip(self),
        fields(registered = self.registry.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();

        // Phase 1: fire the root signal. Every receive loop observes it
        // and exits; the accept loop stops taking connections.
        tracing::info!(reason = %reason, "Shutdown: signalling all connections");
        // send_replace stores the value even with no live receivers.
        self.shutdown_tx.send_replace(true);

        // Phase 2: dispose every registered handle, bounded concurrency.
        let handles = self.registry.all();
        let total = handles.len();
        let join_timeout = self.config.join_timeout();
        let mut disposed = 0usize;
        let mut forced = 0usize;

        let mut futures = FuturesUnordered::new();
        let mut pending = 0usize;
        for handle in handles {
            futures.push(async move { handle.dispose(join_timeout).await });
            pending += 1;

            while pending >= self.config.max_concurrent_disposals {
                if let Some(was_forced) = futures.next().await {
                    pending -= 1;
                    disposed += 1;
                    if was_forced {
                        forced += 1;
                    }
                } else {
                    break;
                }
            }
        }
        while let Some(was_forced) = futures.next().await {
            disposed += 1;
            if was_forced {
                forced += 1;
            }
        }

        let result = ShutdownResult {
            handles_disposed: disposed,
            forced,
            duration: start.elapsed(),
        };

        tracing::info!(
            registered = total,
            disposed = result.handles_disposed,
            forced = result.forced,
            duration_ms = result.duration.as_millis() as u64,
            "Shutdown completed"
        );

        result
    }
}

/// Result of a shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Handles disposed (or confirmed already disposed) during this pass
    pub handles_disposed: usize,
    /// Handles whose tasks had to be aborted after the join timeout
    pub forced: usize,
    /// Total time taken for the teardown
    pub duration: Duration,
}
