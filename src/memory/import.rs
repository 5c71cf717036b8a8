//! Read-only attachment of a peer's segment, guarded by a memory trap.

use super::{MemorySegment, MemoryType, MemTrap, SharedSegment};
use crate::config::ShmConfig;
use crate::error::Result;

/// A peer's shared segment mapped read-only with SIGBUS containment.
///
/// If the peer truncates the object, reads return zeroes instead of
/// crashing and [`is_good`](MemorySegment::is_good) turns false.
#[derive(Debug)]
pub struct ImportedSegment {
    // Declared first: the trap must be removed before the range is unmapped.
    trap: MemTrap,
    segment: SharedSegment,
}

impl ImportedSegment {
    /// Attach `/<prefix>-<id>` and register the mapping with the trap service.
    pub fn attach(config: &ShmConfig, id: u32) -> Result<Self> {
        let segment = SharedSegment::attach_ro_in(config, id)?;
        let trap = MemTrap::add(segment.as_ptr(), segment.mapped_len())?;
        Ok(Self { trap, segment })
    }

    /// Segment id.
    pub fn id(&self) -> u32 {
        self.segment.id()
    }

    /// PID stamped by the creator, while the mapping is intact.
    pub fn marker_pid(&self) -> Option<u32> {
        self.segment.marker_pid()
    }
}

impl MemorySegment for ImportedSegment {
    fn as_ptr(&self) -> *const u8 {
        self.segment.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        None
    }

    fn len(&self) -> usize {
        self.segment.len()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Imported
    }

    fn shm_id(&self) -> Option<u32> {
        Some(self.segment.id())
    }

    fn is_good(&self) -> bool {
        self.trap.is_good()
    }
}
