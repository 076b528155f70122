//! Server metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A serializable snapshot of a server's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Connections accepted since start.
    pub connections_accepted: u64,

    /// Failed accept attempts.
    pub accept_errors: u64,

    /// Connections accepted and not yet closed.
    pub active_connections: u64,

    /// Packets handed to the receive hook.
    pub packets_received: u64,

    /// Packets written to a socket.
    pub packets_sent: u64,

    /// Bytes written to sockets.
    pub bytes_sent: u64,

    /// Async writes rejected with a backpressure error.
    pub write_rejections: u64,

    /// Connections closed by the heartbeat task.
    pub heartbeat_timeouts: u64,

    /// Panics caught at a task boundary.
    pub task_panics: u64,
}

/// Lock-free counters shared by the server and all of its connections.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub(crate) connections_accepted: AtomicU64,
    pub(crate) accept_errors: AtomicU64,
    pub(crate) active_connections: AtomicU64,
    pub(crate) packets_received: AtomicU64,
    pub(crate) packets_sent: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) write_rejections: AtomicU64,
    pub(crate) heartbeat_timeouts: AtomicU64,
    pub(crate) task_panics: AtomicU64,
}

impl ServerMetrics {
    /// Creates a new `ServerMetrics` with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        // saturating: a close without a matching accept must not wrap
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub(crate) fn packet_sent(&self, size: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            write_rejections: self.write_rejections.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            task_panics: self.task_panics.load(Ordering::Relaxed),
        }
    }
}
