//! Transport metrics collection.
//!
//! One [`TransportMetrics`] per engine or channel manager; nothing is global.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::notify::DispatchOutcome;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Requests written to the wire.
    pub requests_sent: u64,
    /// Final responses matched to a waiter.
    pub responses_received: u64,
    /// Interim (async pending) responses.
    pub interim_responses: u64,
    /// Requests that hit their deadline.
    pub timeouts_total: u64,
    /// Stray, duplicate or undecodable frames.
    pub protocol_anomalies: u64,
    /// Notifications handed to the dispatcher.
    pub notifications_routed: u64,
    /// Routed notifications a handler accepted.
    pub notifications_dispatched: u64,
    /// Routed notifications with no active handler.
    pub notifications_dropped: u64,
    /// Routed notifications whose handler failed or panicked.
    pub handler_failures: u64,
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Currently open connections.
    pub active_connections: u32,
    /// Channels failed over.
    pub channel_failovers: u64,
    /// Total bytes sent.
    pub bytes_sent: u64,
    /// Total bytes received.
    pub bytes_received: u64,
}

/// Thread-safe transport metrics collector.
pub struct TransportMetrics {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    interim_responses: AtomicU64,
    timeouts_total: AtomicU64,
    protocol_anomalies: AtomicU64,
    notifications_routed: AtomicU64,
    notifications_dispatched: AtomicU64,
    notifications_dropped: AtomicU64,
    handler_failures: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
    channel_failovers: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            interim_responses: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            protocol_anomalies: AtomicU64::new(0),
            notifications_routed: AtomicU64::new(0),
            notifications_dispatched: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
            channel_failovers: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Records a request written to the wire.
    pub fn request_sent(&self, bytes: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records a frame read from the wire.
    pub fn add_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Increments the matched responses counter.
    pub fn inc_responses_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the interim responses counter.
    pub fn inc_interim_responses(&self) {
        self.interim_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the timeouts counter.
    pub fn inc_timeouts_total(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the protocol anomalies counter.
    pub fn inc_protocol_anomalies(&self) {
        self.protocol_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the routed notifications counter.
    pub fn inc_notifications_routed(&self) {
        self.notifications_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records what the dispatcher did with a routed notification.
    pub fn notification_outcome(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Delivered => &self.notifications_dispatched,
            DispatchOutcome::Dropped => &self.notifications_dropped,
            DispatchOutcome::HandlerFailed => &self.handler_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the channel failover counter.
    pub fn inc_channel_failovers(&self) {
        self.channel_failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a new connection opened, incrementing both opened counter and active connections.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection closed, decrementing active connections.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            interim_responses: self.interim_responses.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            protocol_anomalies: self.protocol_anomalies.load(Ordering::Relaxed),
            notifications_routed: self.notifications_routed.load(Ordering::Relaxed),
            notifications_dispatched: self.notifications_dispatched.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            channel_failovers: self.channel_failovers.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    #[test]
    fn test_metrics_new() {
        assert_eq!(TransportMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters() {
        let metrics = TransportMetrics::new();
        metrics.request_sent(100);
        metrics.request_sent(28);
        metrics.add_bytes_received(64);
        metrics.inc_responses_received();
        metrics.inc_interim_responses();
        metrics.inc_timeouts_total();
        metrics.inc_protocol_anomalies();
        metrics.inc_notifications_routed();
        metrics.notification_outcome(DispatchOutcome::Delivered);
        metrics.notification_outcome(DispatchOutcome::Dropped);
        metrics.notification_outcome(DispatchOutcome::Dropped);
        metrics.notification_outcome(DispatchOutcome::HandlerFailed);
        metrics.inc_channel_failovers();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_sent, 2);
        assert_eq!(snapshot.bytes_sent, 128);
        assert_eq!(snapshot.bytes_received, 64);
        assert_eq!(snapshot.responses_received, 1);
        assert_eq!(snapshot.interim_responses, 1);
        assert_eq!(snapshot.timeouts_total, 1);
        assert_eq!(snapshot.protocol_anomalies, 1);
        assert_eq!(snapshot.notifications_routed, 1);
        assert_eq!(snapshot.notifications_dispatched, 1);
        assert_eq!(snapshot.notifications_dropped, 2);
        assert_eq!(snapshot.handler_failures, 1);
        assert_eq!(snapshot.channel_failovers, 1);
    }

    #[test]
    fn test_connection_close_saturating() {
        let metrics = TransportMetrics::new();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.connections_opened, 1);
        assert_eq!(snapshot.connections_closed, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = TransportMetrics::new();
        metrics.inc_protocol_anomalies();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["protocol_anomalies"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_metrics() {
        let metrics = Arc::new(TransportMetrics::new());
        let mut join_set = JoinSet::new();

        for _ in 0..10 {
            let metrics = Arc::clone(&metrics);
            join_set.spawn(async move {
                for _ in 0..100 {
                    metrics.request_sent(10);
                    metrics.add_bytes_received(20);
                }
            });
        }

        while join_set.join_next().await.is_some() {}

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_sent, 1000);
        assert_eq!(snapshot.bytes_sent, 10_000);
        assert_eq!(snapshot.bytes_received, 20_000);
    }
}
