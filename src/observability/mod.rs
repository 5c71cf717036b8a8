//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters and gauges via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! Nothing here is called on a realtime path. `post`, `get` and `done` on
//! the message queue record no metrics; the control-side operations do.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `sonance_shm_segments_created` | Counter | Segments created (`shared` label) |
//! | `sonance_shm_segments_reaped` | Counter | Orphaned segments unlinked by cleanup |
//! | `sonance_shm_bytes_mapped` | Gauge | Bytes mapped by live writable segments |
//! | `sonance_messages_sent` | Counter | Blocking `send` calls completed |
//! | `sonance_messages_drained` | Counter | Undelivered messages released at queue teardown |
//! | `sonance_queue_depth` | Gauge | Pending messages, sampled on the control side |
//! | `sonance_memtrap_registrations` | Gauge | Live memory trap registrations |
//! | `sonance_timers_fired` | Counter | Housekeeping timers run |
//!
//! ## Example
//!
//! ```rust,ignore
//! use sonance::observability::init_metrics;
//!
//! // Initialize metrics (call once at startup)
//! init_metrics();
//!
//! // Install any metrics exporter (prometheus, statsd, ...) to collect them
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    QueueMetrics, init_metrics, record_memtrap_registrations, record_segment_created,
    record_segment_reaped, record_segment_unmapped, record_timer_fired,
};
pub use tracing_support::{instrument_queue, span_housekeeper, span_queue, trace_segment_reaped};
