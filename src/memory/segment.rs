//! Memory segment trait and types.

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Process heap.
    Heap,
    /// Private anonymous mapping (a non-shared [`SharedSegment`](super::SharedSegment)).
    Private,
    /// Named POSIX shared memory created by this process.
    Shared,
    /// Shared memory created by a peer and attached read-only.
    Imported,
}

impl MemoryType {
    /// Can this memory be reached from another process?
    #[inline]
    pub fn supports_ipc(&self) -> bool {
        matches!(self, MemoryType::Shared | MemoryType::Imported)
    }
}

/// Trait for memory segment backends.
///
/// A memory segment is a contiguous region that message chunks point into.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
pub trait MemorySegment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    ///
    /// Returns `None` if the segment is read-only.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Usable size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Shared memory id, for segments a peer can attach.
    fn shm_id(&self) -> Option<u32> {
        None
    }

    /// False once the contents can no longer be trusted (the peer truncated
    /// the backing object and the range was remapped to zeroes).
    fn is_good(&self) -> bool {
        true
    }

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this memory.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Get the segment as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to this memory.
    #[allow(clippy::mut_from_ref)]
    unsafe fn as_mut_slice(&self) -> Option<&mut [u8]> {
        // SAFETY: Caller guarantees exclusive access.
        self.as_mut_ptr()
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr, self.len()) })
    }
}
