//! Lock-free free list for recycling fixed-size nodes.
//!
//! A [`FreeList`] owns a fixed array of cells threaded into two Treiber
//! stacks: `empty` holds cells with no value, `stored` holds cells carrying
//! a value. Every cell sits in exactly one stack, or is held by exactly one
//! in-flight `push`/`pop` while its value is being moved.
//!
//! Stack heads pack a cell index (low 32 bits) with an ABA tag (high 32 bits)
//! that is bumped on every successful CAS, so a head that was popped and
//! pushed back between our load and our CAS can never be mistaken for the
//! one we loaded.
//!
//! # Example
//!
//! ```rust
//! use sonance::sync::FreeList;
//!
//! let list: FreeList<Box<u64>> = FreeList::new(4);
//!
//! // Recycle an allocation instead of freeing it
//! let node = list.pop().unwrap_or_else(|| Box::new(0));
//! if let Err(node) = list.push(node) {
//!     drop(node); // list full: fall back to the heap
//! }
//! ```

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Default number of cells when `0` is requested.
pub const DEFAULT_CAPACITY: usize = 128;

/// Sentinel index marking the end of a stack.
const STACK_END: u32 = u32::MAX;

#[inline]
fn pack_head(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | (index as u64)
}

#[inline]
fn unpack_head(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}

struct Cell<T> {
    /// Next cell index in whichever stack currently holds this cell.
    next: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Tagged-index Treiber stack over the cell array.
struct Stack {
    head: AtomicU64,
}

impl Stack {
    fn new(first: u32) -> Self {
        Self {
            head: AtomicU64::new(pack_head(first, 0)),
        }
    }

    fn pop<T>(&self, cells: &[Cell<T>]) -> Option<u32> {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let (index, tag) = unpack_head(old);
            if index == STACK_END {
                return None;
            }

            // May be stale if another thread raced us; the tag makes the CAS fail then.
            let next = cells[index as usize].next.load(Ordering::Acquire);
            let new = pack_head(next, tag.wrapping_add(1));

            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
            std::hint::spin_loop();
        }
    }

    fn push<T>(&self, cells: &[Cell<T>], index: u32) {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let (head, tag) = unpack_head(old);
            cells[index as usize].next.store(head, Ordering::Release);
            let new = pack_head(index, tag.wrapping_add(1));

            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }
}

/// A lock-free multi-producer/multi-consumer pool of values.
///
/// `push` fails softly when every cell is occupied, handing the value back
/// so the caller can free it normally. `pop` returns `None` when nothing is
/// stored. Neither operation allocates or blocks.
pub struct FreeList<T> {
    cells: Box<[Cell<T>]>,
    empty: Stack,
    stored: Stack,
    len: AtomicUsize,
}

// SAFETY: values move in and out under exclusive cell ownership obtained from
// the stacks; the list never hands out references to stored values.
unsafe impl<T: Send> Send for FreeList<T> {}
unsafe impl<T: Send> Sync for FreeList<T> {}

impl<T> FreeList<T> {
    /// Create a free list with `capacity` cells.
    ///
    /// A capacity of `0` selects [`DEFAULT_CAPACITY`].
    ///
    /// # Panics
    ///
    /// Panics if `capacity` does not fit the 32-bit cell index space.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        assert!(
            capacity < STACK_END as usize,
            "free list capacity out of range"
        );

        let cells: Box<[Cell<T>]> = (0..capacity)
            .map(|i| Cell {
                next: AtomicU32::new(if i + 1 < capacity {
                    (i + 1) as u32
                } else {
                    STACK_END
                }),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            cells,
            empty: Stack::new(0),
            stored: Stack::new(STACK_END),
            len: AtomicUsize::new(0),
        }
    }

    /// Store a value.
    ///
    /// Returns `Err(value)` when the list is full. That is an expected
    /// condition, not a fault.
    pub fn push(&self, value: T) -> std::result::Result<(), T> {
        let Some(index) = self.empty.pop(&self.cells) else {
            return Err(value);
        };

        // SAFETY: the cell was just taken off the empty stack; no other thread
        // can reach it until we push it onto the stored stack.
        unsafe {
            (*self.cells[index as usize].value.get()).write(value);
        }

        // Count first: a racing pop may take the cell as soon as it is published
        self.len.fetch_add(1, Ordering::Relaxed);
        self.stored.push(&self.cells, index);
        Ok(())
    }

    /// Take a stored value, if any.
    pub fn pop(&self) -> Option<T> {
        let index = self.stored.pop(&self.cells)?;

        // SAFETY: the cell came off the stored stack, so it holds an
        // initialized value and we are its only owner.
        let value = unsafe { (*self.cells[index as usize].value.get()).assume_init_read() };

        self.empty.push(&self.cells, index);
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// Number of cells.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Approximate number of stored values.
    ///
    /// Note: This is a snapshot and may change immediately after returning.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns true if no values are stored (snapshot).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for FreeList<T> {
    fn drop(&mut self) {
        while let Some(value) = self.pop() {
            drop(value);
        }
    }
}

impl<T> std::fmt::Debug for FreeList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
