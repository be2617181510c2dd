//! Relay metrics for observability
//!
//! Counters for connection churn and fan-out outcomes. Discarded sends are
//! counted here rather than surfaced to senders.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::router::BroadcastReport;

#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Connection metrics
    /// Currently open WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since start
    pub total_connections: AtomicU64,
    /// Identity tokens handed out
    pub identities_issued: AtomicU64,

    // Message metrics
    /// Payloads received from clients
    pub messages_received: AtomicU64,
    /// Payloads queued to recipients
    pub deliveries: AtomicU64,
    /// Sends dropped because the recipient's writer was gone
    pub sends_discarded: AtomicU64,
    /// Broadcasts that targeted an unregistered channel
    pub unknown_channel_broadcasts: AtomicU64,

    // Registry metrics
    /// Closed members dropped by lazy pruning
    pub members_pruned: AtomicU64,
    /// Channel entries deleted after losing all open members
    pub channels_removed: AtomicU64,

    /// Transport-level errors reported by connections
    pub transport_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn identity_issued(&self) {
        self.identities_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_discarded(&self) {
        self.sends_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the outcome of one broadcast pass into the counters.
    pub fn record_broadcast(&self, report: &BroadcastReport) {
        if report.missing {
            self.unknown_channel_broadcasts.fetch_add(1, Ordering::Relaxed);
        }
        if report.removed {
            self.channels_removed.fetch_add(1, Ordering::Relaxed);
        }
        self.members_pruned
            .fetch_add(report.pruned as u64, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.sends_discarded
            .fetch_add(report.discarded as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                identities_issued: self.identities_issued.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                delivered: self.deliveries.load(Ordering::Relaxed),
                discarded: self.sends_discarded.load(Ordering::Relaxed),
                unknown_channel: self.unknown_channel_broadcasts.load(Ordering::Relaxed),
            },
            channels: ChannelMetrics {
                members_pruned: self.members_pruned.load(Ordering::Relaxed),
                removed: self.channels_removed.load(Ordering::Relaxed),
            },
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub channels: ChannelMetrics,
    pub transport_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub identities_issued: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub delivered: u64,
    pub discarded: u64,
    pub unknown_channel: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub members_pruned: u64,
    pub removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = RelayMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_record_broadcast() {
        let metrics = RelayMetrics::new();
        metrics.record_broadcast(&BroadcastReport {
            pruned: 2,
            delivered: 3,
            discarded: 1,
            ..Default::default()
        });
        metrics.record_broadcast(&BroadcastReport {
            missing: true,
            ..Default::default()
        });
        metrics.record_broadcast(&BroadcastReport {
            removed: true,
            pruned: 1,
            ..Default::default()
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages.delivered, 3);
        assert_eq!(snapshot.messages.discarded, 1);
        assert_eq!(snapshot.messages.unknown_channel, 1);
        assert_eq!(snapshot.channels.members_pruned, 3);
        assert_eq!(snapshot.channels.removed, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = RelayMetrics::new();
        metrics.connection_opened();
        metrics.message_received();
        metrics.transport_error();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["connections"]["active"], 1);
        assert_eq!(json["messages"]["received"], 1);
        assert_eq!(json["transport_errors"], 1);
    }
}
