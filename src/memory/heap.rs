//! Heap-backed memory segment.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use std::ptr::NonNull;

/// A memory segment backed by a heap allocation.
///
/// Used for message payloads that never leave the process.
///
/// # Example
///
/// ```rust
/// use sonance::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024).unwrap();
/// assert_eq!(segment.len(), 1024);
/// ```
pub struct HeapSegment {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the allocation is owned by the segment; concurrent access to the
// bytes is the caller's contract, as for every `MemorySegment`.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

impl HeapSegment {
    /// Create a zero-initialized heap segment.
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let data: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(data)).cast::<u8>();
        Ok(Self { ptr, len: size })
    }

    /// Create a segment holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let segment = Self::new(bytes.len())?;
        // SAFETY: freshly allocated, exactly `bytes.len()` long, not yet shared.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), segment.ptr.as_ptr(), bytes.len());
        }
        Ok(segment)
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.ptr.as_ptr())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: the pointer came from `Box::leak` of a boxed slice of `len` bytes.
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl std::fmt::Debug for HeapSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapSegment").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_segment_creation() {
        let segment = HeapSegment::new(1024).unwrap();
        assert_eq!(segment.len(), 1024);
        assert_eq!(segment.memory_type(), MemoryType::Heap);
        assert!(segment.shm_id().is_none());
        assert!(segment.is_good());
    }

    #[test]
    fn test_heap_segment_zero_size_fails() {
        assert!(HeapSegment::new(0).is_err());
    }

    #[test]
    fn test_heap_segment_read_write() {
        let segment = HeapSegment::new(16).unwrap();

        let ptr = segment.as_mut_ptr().unwrap();
        unsafe {
            std::ptr::write(ptr, 42);
            std::ptr::write(ptr.add(1), 43);
        }

        let slice = unsafe { segment.as_slice() };
        assert_eq!(&slice[..3], &[42, 43, 0]);
    }

    #[test]
    fn test_heap_segment_from_bytes() {
        let segment = HeapSegment::from_bytes(b"hello").unwrap();
        assert_eq!(unsafe { segment.as_slice() }, b"hello");
    }
}
