//! Relay metrics for observability
//!
//! Counters are bumped from connection tasks and the router; the snapshot is
//! logged on shutdown and available to embedders through `Server::metrics`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Connections currently being served (handshaking or active)
    pub active_connections: AtomicU64,
    /// Total connections accepted since server start
    pub total_connections: AtomicU64,
    /// Connections closed before completing a valid handshake
    pub handshake_failures: AtomicU64,
    /// Registrations that replaced a live connection for the same user
    pub superseded_connections: AtomicU64,

    // Message metrics
    /// Frames decoded from clients after the handshake
    pub messages_received: AtomicU64,
    /// Frames queued to a recipient
    pub frames_delivered: AtomicU64,
    /// Messages routed to nobody: receiver offline, or rejected outright
    pub messages_dropped: AtomicU64,

    // Error metrics
    /// Recipients whose outbound queue was full or closed
    pub send_failures: AtomicU64,
    /// Inbound frames that failed to decode
    pub decode_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_superseded(&self) {
        self.superseded_connections.fetch_add(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
                superseded: self.superseded_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                delivered: self.frames_delivered.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                send_failures: self.send_failures.load(Ordering::Relaxed),
                decode: self.decode_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub handshake_failures: u64,
    pub superseded: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub send_failures: u64,
    pub decode: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections.active, 1);
        assert_eq!(snap.connections.total, 2);
    }

    #[test]
    fn test_message_tracking() {
        let metrics = ServerMetrics::new();

        metrics.message_received();
        metrics.frame_delivered();
        metrics.frame_delivered();
        metrics.message_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.messages.received, 1);
        assert_eq!(snap.messages.delivered, 2);
        assert_eq!(snap.messages.dropped, 1);
    }

    #[test]
    fn test_error_tracking() {
        let metrics = ServerMetrics::new();

        metrics.send_failed();
        metrics.decode_error();
        metrics.decode_error();
        metrics.handshake_failed();
        metrics.connection_superseded();

        let snap = metrics.snapshot();
        assert_eq!(snap.errors.send_failures, 1);
        assert_eq!(snap.errors.decode, 2);
        assert_eq!(snap.connections.handshake_failures, 1);
        assert_eq!(snap.connections.superseded, 1);
    }

    #[test]
    fn test_default_has_no_uptime() {
        let metrics = ServerMetrics::default();
        assert_eq!(metrics.uptime_secs(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["connections"]["active"], 1);
        assert_eq!(json["messages"]["dropped"], 0);
    }
}
