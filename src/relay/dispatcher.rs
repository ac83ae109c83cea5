use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::connection::ConnectionRegistry;
use crate::relay::RelayEvent;

/// Statistics for the relay fan-out
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Events taken off the inbound channel
    pub events_relayed: AtomicU64,
    /// Successful per-recipient sends
    pub chunks_delivered: AtomicU64,
    /// Per-recipient sends that failed (channel full or connection gone)
    pub chunks_dropped: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            events_relayed: self.events_relayed.load(Ordering::Relaxed),
            chunks_delivered: self.chunks_delivered.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of relay statistics
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatsSnapshot {
    pub events_relayed: u64,
    pub chunks_delivered: u64,
    pub chunks_dropped: u64,
}

/// Forwards each received event to every registered connection except its
/// sender, and republishes it to external subscribers.
pub struct RelayDispatcher {
    registry: Arc<ConnectionRegistry>,
    subscribers: broadcast::Sender<RelayEvent>,
    stats: RelayStats,
}

impl RelayDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, subscribers: broadcast::Sender<RelayEvent>) -> Self {
        Self {
            registry,
            subscribers,
            stats: RelayStats::default(),
        }
    }

    /// Get relay statistics
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drain the inbound channel until it closes, fanning out each event.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<RelayEvent>) {
        tracing::debug!("Relay dispatcher started");
        while let Some(event) = inbound.recv().await {
            self.relay(&event);
        }
        tracing::debug!("Relay dispatcher stopped");
    }

    /// Fan one event out to every connection whose id differs from the
    /// sender's. Sends are independent: a failed recipient is counted and
    /// skipped, never aborts the pass. No ordering guarantee across
    /// recipients.
    #[tracing::instrument(
        name = "relay.fan_out",
        skip(self, event),
        fields(sender_id = %event.sender_id, bytes = event.text.len())
    )]
    pub fn relay(&self, event: &RelayEvent) {
        let connections = self.registry.all();
        let mut delivered = 0u64;
        let mut dropped = 0u64;

        for conn in &connections {
            if conn.id == event.sender_id {
                continue;
            }
            match conn.send(&event.text) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    dropped += 1;
                    tracing::debug!(
                        connection_id = %conn.id,
                        sender_id = %event.sender_id,
                        error = %e,
                        "Failed to forward chunk to recipient"
                    );
                }
            }
        }

        self.stats.events_relayed.fetch_add(1, Ordering::Relaxed);
        self.stats.chunks_delivered.fetch_add(delivered, Ordering::Relaxed);
        self.stats.chunks_dropped.fetch_add(dropped, Ordering::Relaxed);

        // External observers; a lagging or absent subscriber is not an error.
        let _ = self.subscribers.send(event.clone());

        tracing::debug!(
            sender_id = %event.sender_id,
            delivered = delivered,
            dropped = dropped,
            "Relayed chunk"
        );
    }
}
