//! Observability and Metrics
//!
//! Counters for monitoring transport throughput and health.
//!
//! Uses atomic counters for thread-safe metrics collection. A [`Metrics`] instance is
//! shared through an `Arc` by the components that report into it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for transport operations
#[derive(Debug)]
pub struct Metrics {
    /// Total frames written to a socket
    pub frames_sent: AtomicU64,
    /// Total bytes written to a socket
    pub bytes_sent: AtomicU64,
    /// Total frames read from a socket
    pub frames_received: AtomicU64,
    /// Total bytes read from a socket
    pub bytes_received: AtomicU64,
    /// Frames handed to the application
    pub frames_delivered: AtomicU64,
    /// Reliable frames resent by the sweep
    pub frames_resent: AtomicU64,
    /// Reliable frames given up on after too many resends
    pub frames_abandoned: AtomicU64,
    /// Sessions closed after giving up on a frame
    pub sessions_failed: AtomicU64,
    /// Acks that removed an unacked entry
    pub acks_received: AtomicU64,
    /// Stale or duplicate sequences dropped
    pub duplicates_dropped: AtomicU64,
    /// Frames parked in a receive window
    pub out_of_order_buffered: AtomicU64,
    /// Frames rejected because a receive window was full
    pub window_overflows: AtomicU64,
    /// Queued frames dropped without being written
    pub send_drops: AtomicU64,
    /// Rent attempts that found a pool empty
    pub pool_exhaustions: AtomicU64,
    /// Frames discarded by the decoder
    pub malformed_frames: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            frames_resent: AtomicU64::new(0),
            frames_abandoned: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            out_of_order_buffered: AtomicU64::new(0),
            window_overflows: AtomicU64::new(0),
            send_drops: AtomicU64::new(0),
            pool_exhaustions: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a frame written to a socket
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame read from a socket
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record frames handed to the application
    pub fn frames_delivered(&self, count: u64) {
        self.frames_delivered.fetch_add(count, Ordering::Relaxed);
    }

    /// Record resent frames
    pub fn frames_resent(&self, count: u64) {
        self.frames_resent.fetch_add(count, Ordering::Relaxed);
    }

    /// Record abandoned frames
    pub fn frames_abandoned(&self, count: u64) {
        self.frames_abandoned.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a session closed after an abandoned frame
    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an ack that cleared an unacked entry
    pub fn ack_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stale or duplicate sequence
    pub fn duplicate_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame parked in a receive window
    pub fn out_of_order_buffered(&self) {
        self.out_of_order_buffered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame rejected by a full receive window
    pub fn window_overflow(&self) {
        self.window_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a queued frame that was never written
    pub fn send_dropped(&self) {
        self.send_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rent attempt against an empty pool
    pub fn pool_exhausted(&self) {
        self.pool_exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame discarded by the decoder
    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_resent: self.frames_resent.load(Ordering::Relaxed),
            frames_abandoned: self.frames_abandoned.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            out_of_order_buffered: self.out_of_order_buffered.load(Ordering::Relaxed),
            window_overflows: self.window_overflows.load(Ordering::Relaxed),
            send_drops: self.send_drops.load(Ordering::Relaxed),
            pool_exhaustions: self.pool_exhaustions.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            frames_sent = snapshot.frames_sent,
            bytes_sent = snapshot.bytes_sent,
            frames_received = snapshot.frames_received,
            bytes_received = snapshot.bytes_received,
            frames_delivered = snapshot.frames_delivered,
            frames_resent = snapshot.frames_resent,
            frames_abandoned = snapshot.frames_abandoned,
            sessions_failed = snapshot.sessions_failed,
            acks_received = snapshot.acks_received,
            duplicates_dropped = snapshot.duplicates_dropped,
            out_of_order_buffered = snapshot.out_of_order_buffered,
            window_overflows = snapshot.window_overflows,
            send_drops = snapshot.send_drops,
            pool_exhaustions = snapshot.pool_exhaustions,
            malformed_frames = snapshot.malformed_frames,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_delivered: u64,
    pub frames_resent: u64,
    pub frames_abandoned: u64,
    pub sessions_failed: u64,
    pub acks_received: u64,
    pub duplicates_dropped: u64,
    pub out_of_order_buffered: u64,
    pub window_overflows: u64,
    pub send_drops: u64,
    pub pool_exhaustions: u64,
    pub malformed_frames: u64,
    pub uptime_seconds: u64,
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
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
