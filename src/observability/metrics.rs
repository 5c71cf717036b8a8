//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const SEGMENTS_CREATED: &str = "sonance_shm_segments_created";
const SEGMENTS_REAPED: &str = "sonance_shm_segments_reaped";
const BYTES_MAPPED: &str = "sonance_shm_bytes_mapped";
const MESSAGES_SENT: &str = "sonance_messages_sent";
const MESSAGES_DRAINED: &str = "sonance_messages_drained";
const QUEUE_DEPTH: &str = "sonance_queue_depth";
const MEMTRAP_REGISTRATIONS: &str = "sonance_memtrap_registrations";
const TIMERS_FIRED: &str = "sonance_timers_fired";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        SEGMENTS_CREATED,
        Unit::Count,
        "Total number of memory segments created"
    );
    metrics::describe_counter!(
        SEGMENTS_REAPED,
        Unit::Count,
        "Orphaned shared segments removed by cleanup"
    );
    metrics::describe_gauge!(
        BYTES_MAPPED,
        Unit::Bytes,
        "Bytes mapped by live writable segments"
    );
    metrics::describe_counter!(
        MESSAGES_SENT,
        Unit::Count,
        "Blocking sends completed on a message queue"
    );
    metrics::describe_counter!(
        MESSAGES_DRAINED,
        Unit::Count,
        "Undelivered messages released when a queue was dropped"
    );
    metrics::describe_gauge!(
        QUEUE_DEPTH,
        Unit::Count,
        "Number of messages pending in a queue"
    );
    metrics::describe_gauge!(
        MEMTRAP_REGISTRATIONS,
        Unit::Count,
        "Live memory trap registrations"
    );
    metrics::describe_counter!(TIMERS_FIRED, Unit::Count, "Housekeeping timers run");
}

/// Record a newly mapped segment.
#[inline]
pub fn record_segment_created(shared: bool, bytes: usize) {
    counter!(SEGMENTS_CREATED, "shared" => if shared { "true" } else { "false" }).increment(1);
    gauge!(BYTES_MAPPED).increment(bytes as f64);
}

/// Record a writable segment being unmapped.
#[inline]
pub fn record_segment_unmapped(bytes: usize) {
    gauge!(BYTES_MAPPED).decrement(bytes as f64);
}

/// Record orphans removed by one cleanup pass.
#[inline]
pub fn record_segment_reaped(prefix: &str, count: usize) {
    counter!(SEGMENTS_REAPED, "prefix" => prefix.to_string()).increment(count as u64);
}

/// Record the number of live trap registrations.
#[inline]
pub fn record_memtrap_registrations(live: usize) {
    gauge!(MEMTRAP_REGISTRATIONS).set(live as f64);
}

/// Record a housekeeping timer run.
#[inline]
pub fn record_timer_fired(name: &str) {
    counter!(TIMERS_FIRED, "timer" => name.to_string()).increment(1);
}

/// Metrics handles for one message queue, labelled once at construction.
#[derive(Clone)]
pub struct QueueMetrics {
    name: String,
    sent: Counter,
    drained: Counter,
    depth: Gauge,
}

impl QueueMetrics {
    /// Create the handles for the queue called `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sent: counter!(MESSAGES_SENT, "queue" => name.to_string()),
            drained: counter!(MESSAGES_DRAINED, "queue" => name.to_string()),
            depth: gauge!(QUEUE_DEPTH, "queue" => name.to_string()),
        }
    }

    /// Record a completed `send`.
    #[inline]
    pub fn record_sent(&self) {
        self.sent.increment(1);
    }

    /// Record messages released at teardown.
    #[inline]
    pub fn record_drained(&self, count: usize) {
        self.drained.increment(count as u64);
    }

    /// Record the current queue depth.
    #[inline]
    pub fn record_depth(&self, depth: usize) {
        self.depth.set(depth as f64);
    }

    /// Get the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        // Idempotent
        init_metrics();
    }

    #[test]
    fn test_queue_metrics() {
        let metrics = QueueMetrics::new("test-queue");
        metrics.record_sent();
        metrics.record_drained(3);
        metrics.record_depth(7);
        assert_eq!(metrics.name(), "test-queue");
    }

    #[test]
    fn test_global_recording_functions() {
        // No recorder installed: these must be no-ops
        record_segment_created(true, 4096);
        record_segment_unmapped(4096);
        record_segment_reaped("test", 2);
        record_memtrap_registrations(1);
        record_timer_fired("gc");
    }
}
