//! Tracing spans and structured log helpers.

use tracing::{Level, Span, span};

/// Create a span for control-side work on a message queue.
///
/// # Example
///
/// ```rust,ignore
/// use sonance::observability::span_queue;
///
/// let span = span_queue("io-thread");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_queue(name: &str) -> Span {
    span!(Level::DEBUG, "asyncmsgq", queue = %name)
}

/// Enter a queue span and return the guard.
pub fn instrument_queue(name: &str) -> tracing::span::EnteredSpan {
    span_queue(name).entered()
}

/// Create a span for the housekeeping loop.
#[inline]
pub fn span_housekeeper() -> Span {
    span!(Level::INFO, "housekeeper")
}

/// Log an orphaned segment being removed.
#[inline]
pub fn trace_segment_reaped(prefix: &str, id: u32, pid: u32) {
    tracing::info!(
        prefix = %prefix,
        id = id,
        owner_pid = pid,
        "removed orphaned shared memory segment"
    );
}
