//! Memory: segments, blocks and SIGBUS containment.
//!
//! # Architecture
//!
//! - [`MemorySegment`]: Trait for memory backends (heap, private or shared mappings)
//! - [`SharedSegment`]: POSIX shared memory with an owner marker, or a private mapping
//! - [`MemTrap`]: Survive peers truncating memory we have mapped
//! - [`ImportedSegment`]: A peer's segment, attached read-only behind a trap
//! - [`MemBlock`] / [`MemChunk`]: Reference-counted windows that messages carry
//!
//! # Example
//!
//! ```rust,ignore
//! use sonance::memory::{MemBlock, MemChunk, SharedSegment};
//! use std::sync::Arc;
//!
//! let segment = Arc::new(SharedSegment::create(64 * 1024, true, 0o700)?);
//! let block = Arc::new(MemBlock::window(segment, 0, 4096));
//! let chunk = MemChunk::new(block, 0, 1024);
//! ```

mod heap;
mod import;
mod memblock;
mod memtrap;
pub mod page;
mod segment;
mod shm;

pub use heap::HeapSegment;
pub use import::ImportedSegment;
pub use memblock::{MemBlock, MemChunk};
pub use memtrap::{MemTrap, MemTrapService};
pub use segment::{MemorySegment, MemoryType};
pub use shm::{MARKER_SIZE, SharedSegment};
