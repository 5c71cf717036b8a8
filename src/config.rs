//! Builder-style configuration for the queue and shared memory layers.

use crate::defaults;
use std::time::Duration;

/// Configuration for an [`AsyncMsgQ`](crate::sync::AsyncMsgQ).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of pending messages before `post` blocks.
    ///
    /// Rounded up to a power of two; `0` selects the default of 256.
    pub capacity: usize,

    /// Number of message items kept for reuse, pre-allocated at construction.
    pub item_pool: usize,

    /// Name for logging and metric labels.
    pub name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::ASYNCQ_DEFAULT_SIZE,
            item_pool: defaults::MSGQ_ITEM_POOL,
            name: String::from("asyncmsgq"),
        }
    }
}

impl QueueConfig {
    /// Create a new config with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Set the item pool size.
    pub fn with_item_pool(mut self, item_pool: usize) -> Self {
        self.item_pool = item_pool;
        self
    }

    /// Set the queue name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Configuration for shared memory segments and their sweeping.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Object name prefix; segments are named `/<prefix>-<id>`.
    pub prefix: String,

    /// Permission bits for newly created objects.
    pub mode: u32,

    /// Period of the housekeeping sweep.
    pub cleanup_interval: Duration,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            prefix: String::from(defaults::SHM_PREFIX),
            mode: defaults::SHM_MODE,
            cleanup_interval: defaults::CLEANUP_INTERVAL,
        }
    }
}

impl ShmConfig {
    /// Create a config using `prefix` for object names.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Set the permission bits.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Set the sweep period.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}
