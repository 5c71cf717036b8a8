//! Default sizes, limits and intervals.
//!
//! # Usage
//!
//! ```rust
//! use sonance::defaults;
//!
//! assert_eq!(defaults::MAX_SHM_SIZE, 64 * 1024 * 1024);
//! ```

use std::time::Duration;

// =============================================================================
// Shared Memory
// =============================================================================

/// Hard cap on the usable size of one segment (64 MiB).
pub const MAX_SHM_SIZE: usize = 64 * 1024 * 1024;

/// Magic value in the trailing marker of every shared segment we create.
pub const SHM_MARKER_MAGIC: u32 = 0xbeef_cafe;

/// Name prefix of shared memory objects (`<prefix>-<decimal id>`).
pub const SHM_PREFIX: &str = "sonance-shm";

/// Where POSIX shared memory objects show up on Linux.
pub const SHM_DIR: &str = "/dev/shm";

/// Permission bits of newly created shared objects.
pub const SHM_MODE: u32 = 0o700;

// =============================================================================
// Queues
// =============================================================================

/// Slots in an async queue when `0` is requested.
pub const ASYNCQ_DEFAULT_SIZE: usize = 256;

/// Recycled message items kept per message queue.
pub const MSGQ_ITEM_POOL: usize = 256;

// =============================================================================
// Housekeeping
// =============================================================================

/// Period of the stale segment sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest period of a periodic timer; shorter periods are raised to this.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

// =============================================================================
// Realtime
// =============================================================================

/// SCHED_FIFO priority for realtime I/O threads.
pub const RT_PRIORITY: i32 = 5;
