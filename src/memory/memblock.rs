//! Reference-counted memory blocks and the chunks messages carry.
//!
//! A [`MemBlock`] is a window of a [`MemorySegment`]. Blocks are shared as
//! `Arc<MemBlock>`; a [`MemChunk`] names a byte range of one block and holds
//! one reference on it for as long as it lives.

use super::{HeapSegment, MemorySegment};
use crate::error::{Error, Result};
use std::sync::Arc;

/// A contiguous window of a memory segment.
pub struct MemBlock {
    segment: Arc<dyn MemorySegment>,
    offset: usize,
    len: usize,
}

impl MemBlock {
    /// A block covering all of `segment`.
    pub fn new(segment: Arc<dyn MemorySegment>) -> Self {
        let len = segment.len();
        Self {
            segment,
            offset: 0,
            len,
        }
    }

    /// A block covering `[offset, offset + len)` of `segment`.
    ///
    /// # Panics
    ///
    /// Panics if the window does not fit in the segment.
    pub fn window(segment: Arc<dyn MemorySegment>, offset: usize, len: usize) -> Self {
        assert!(
            offset
                .checked_add(len)
                .is_some_and(|end| end <= segment.len()),
            "block window out of bounds"
        );
        Self {
            segment,
            offset,
            len,
        }
    }

    /// A zeroed heap block of `len` bytes.
    pub fn heap(len: usize) -> Result<Self> {
        Ok(Self::new(Arc::new(HeapSegment::new(len)?)))
    }

    /// A heap block holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(Arc::new(HeapSegment::from_bytes(bytes)?)))
    }

    /// Block length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the block is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the block within its segment.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The backing segment.
    pub fn segment(&self) -> &Arc<dyn MemorySegment> {
        &self.segment
    }

    /// False if the backing memory was lost to a peer truncation.
    pub fn is_good(&self) -> bool {
        self.segment.is_good()
    }

    /// Returns true if the block cannot be written through this mapping.
    pub fn is_read_only(&self) -> bool {
        self.segment.as_mut_ptr().is_none()
    }

    /// Pointer to the first byte of the block.
    pub fn as_ptr(&self) -> *const u8 {
        // SAFETY: `offset` is within the segment (checked at construction).
        unsafe { self.segment.as_ptr().add(self.offset) }
    }

    /// Copy `bytes` into the block at `offset`.
    ///
    /// # Safety
    ///
    /// No other thread or process may access the range concurrently.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit in the block.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        assert!(
            offset
                .checked_add(bytes.len())
                .is_some_and(|end| end <= self.len),
            "block write out of bounds"
        );
        let base = self
            .segment
            .as_mut_ptr()
            .ok_or_else(|| Error::InvalidSegment("block is read-only".into()))?;

        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(self.offset + offset), bytes.len());
        }
        Ok(())
    }

    /// Copy `[index, index + length)` of the block out.
    fn copy_range(&self, index: usize, length: usize) -> Vec<u8> {
        assert!(index + length <= self.len, "block read out of bounds");
        let mut out = vec![0u8; length];
        // SAFETY: bounds checked above; a racing writer yields torn bytes,
        // never out-of-bounds access.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(index), out.as_mut_ptr(), length);
        }
        out
    }

    /// Copy the whole block out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.copy_range(0, self.len)
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("memory_type", &self.segment.memory_type())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// A byte range of a block, holding one reference on it.
#[derive(Debug, Clone)]
pub struct MemChunk {
    block: Arc<MemBlock>,
    index: usize,
    length: usize,
}

impl MemChunk {
    /// Chunk `[index, index + length)` of `block`.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit in the block.
    pub fn new(block: Arc<MemBlock>, index: usize, length: usize) -> Self {
        assert!(
            index
                .checked_add(length)
                .is_some_and(|end| end <= block.len()),
            "chunk out of bounds"
        );
        Self {
            block,
            index,
            length,
        }
    }

    /// Chunk covering all of `block`.
    pub fn whole(block: Arc<MemBlock>) -> Self {
        let length = block.len();
        Self {
            block,
            index: 0,
            length,
        }
    }

    /// The referenced block.
    pub fn block(&self) -> &Arc<MemBlock> {
        &self.block
    }

    /// Start of the chunk within the block.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Chunk length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Copy the chunk's bytes out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.block.copy_range(self.index, self.length)
    }
}
