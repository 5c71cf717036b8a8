//! # Sonance
//!
//! Transport core of a modular sound server: shared memory segments for
//! moving audio between processes, and lock-free messaging between the
//! realtime I/O thread and the control threads.
//!
//! ## Features
//!
//! - **Free lists**: bounded lock-free object pools ([`sync::FreeList`])
//! - **Message queues**: ordered, exactly-once, poll-integrated
//!   ([`sync::AsyncMsgQ`])
//! - **Shared memory**: named segments with owner markers and orphan sweeping
//!   ([`memory::SharedSegment`])
//! - **Memory traps**: survive a peer truncating a mapped segment
//!   ([`memory::MemTrap`])
//! - **Housekeeping**: deadline-ordered timers on a [`prioq::PrioQ`]
//!
//! ## Quick Start
//!
//! ```rust
//! use sonance::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> sonance::Result<()> {
//! let q = AsyncMsgQ::new(64)?;
//!
//! // Producer side: hand a block of samples to the consumer
//! let block = Arc::new(MemBlock::from_bytes(&[0u8; 256])?);
//! q.post(None, 7, None, Some(&MemChunk::whole(block)));
//!
//! // Consumer side
//! let delivery = q.get(false).expect("message pending");
//! assert_eq!(delivery.chunk().map(|c| c.length()), Some(256));
//! delivery.done(0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod defaults;
pub mod error;
pub mod housekeeping;
pub mod memory;
pub mod observability;
pub mod prioq;
pub mod rt;
pub mod sync;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{QueueConfig, ShmConfig};
    pub use crate::error::{Error, Result};
    pub use crate::housekeeping::Housekeeper;
    pub use crate::memory::{MemBlock, MemChunk, MemTrap, MemorySegment, MemoryType, SharedSegment};
    pub use crate::prioq::PrioQ;
    pub use crate::sync::{AsyncMsgQ, Delivery, FreeList, MsgObject, Userdata};
}

pub use error::{Error, Result};
