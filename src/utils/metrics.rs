//! Observability and Metrics
//!
//! Atomic counters for connection, pipeline and message activity across every
//! node in the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for runtime operations
#[derive(Debug)]
pub struct Metrics {
    /// Inbound connections accepted
    pub connections_accepted: AtomicU64,
    /// Outbound connections dialed
    pub connections_dialed: AtomicU64,
    /// Peers currently registered
    pub peers_active: AtomicU64,
    /// Pipelines that reached the live state
    pub setups_succeeded: AtomicU64,
    /// Pipelines ended by a routine disconnect signal
    pub setups_rejected: AtomicU64,
    /// Pipelines ended by any other error
    pub setups_failed: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Inbound frames dropped because nobody drained them in time
    pub frames_dropped: AtomicU64,
    /// Asynchronous sends refused because the queue stayed full
    pub send_busy: AtomicU64,
    /// Frames that failed to decode
    pub decode_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_dialed: AtomicU64::new(0),
            peers_active: AtomicU64::new(0),
            setups_succeeded: AtomicU64::new(0),
            setups_rejected: AtomicU64::new(0),
            setups_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            send_busy: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_dialed(&self) {
        self.connections_dialed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_registered(&self) {
        self.peers_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_removed(&self) {
        self.peers_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn setup_succeeded(&self) {
        self.setups_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn setup_rejected(&self) {
        self.setups_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn setup_failed(&self) {
        self.setups_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a message received
    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_queue_busy(&self) {
        self.send_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_dialed: self.connections_dialed.load(Ordering::Relaxed),
            peers_active: self.peers_active.load(Ordering::Relaxed),
            setups_succeeded: self.setups_succeeded.load(Ordering::Relaxed),
            setups_rejected: self.setups_rejected.load(Ordering::Relaxed),
            setups_failed: self.setups_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            send_busy: self.send_busy.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_accepted = s.connections_accepted,
            connections_dialed = s.connections_dialed,
            peers_active = s.peers_active,
            setups_succeeded = s.setups_succeeded,
            setups_rejected = s.setups_rejected,
            setups_failed = s.setups_failed,
            messages_sent = s.messages_sent,
            messages_received = s.messages_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            frames_dropped = s.frames_dropped,
            send_busy = s.send_busy,
            decode_errors = s.decode_errors,
            uptime_seconds = s.uptime_seconds,
            "Runtime metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_dialed: u64,
    pub peers_active: u64,
    pub setups_succeeded: u64,
    pub setups_rejected: u64,
    pub setups_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_dropped: u64,
    pub send_busy: u64,
    pub decode_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
