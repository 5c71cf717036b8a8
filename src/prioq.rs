//! Binary min-heap with removal from any position.
//!
//! [`PrioQ`] orders its values with a caller-supplied comparator. Every
//! [`put`](PrioQ::put) returns a [`PrioqHandle`] that stays valid until the
//! value leaves the queue, so a value can be removed, or re-ordered after its
//! sort key changed, in O(log n) without searching.
//!
//! Values live in a slot table; the heap array stores slot keys and every
//! slot records its heap position. Vacated slots are reused, and a generation
//! counter per slot catches stale handles.
//!
//! Not thread-safe: a queue belongs to one context.
//!
//! # Example
//!
//! ```rust
//! use sonance::prioq::PrioQ;
//!
//! let mut q = PrioQ::ordered();
//! q.put(5);
//! let three = q.put(3);
//! q.put(9);
//!
//! assert_eq!(q.peek(), Some(&3));
//! assert_eq!(q.remove(three), 3);
//! assert_eq!(q.pop(), Some(5));
//! ```

use std::cmp::Ordering;

/// Initial heap allocation.
const INITIAL_CAPACITY: usize = 64;

/// Refers to one value held by a [`PrioQ`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrioqHandle {
    key: usize,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    /// Position in `heap` while occupied.
    index: usize,
    generation: u32,
}

/// Min-heap ordered by a comparator.
pub struct PrioQ<T, F> {
    slots: Vec<Slot<T>>,
    /// Slot keys in heap order.
    heap: Vec<usize>,
    vacant: Vec<usize>,
    compare: F,
}

impl<T: Ord> PrioQ<T, fn(&T, &T) -> Ordering> {
    /// Queue ordered by `T`'s own ordering, smallest first.
    pub fn ordered() -> Self {
        Self::new(T::cmp)
    }
}

impl<T, F> PrioQ<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    /// Create an empty queue. `compare` must be a total preorder.
    pub fn new(compare: F) -> Self {
        Self {
            slots: Vec::with_capacity(INITIAL_CAPACITY),
            heap: Vec::with_capacity(INITIAL_CAPACITY),
            vacant: Vec::new(),
            compare,
        }
    }

    /// Number of values held.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a value.
    pub fn put(&mut self, value: T) -> PrioqHandle {
        let index = self.heap.len();
        let key = match self.vacant.pop() {
            Some(key) => {
                let slot = &mut self.slots[key];
                slot.value = Some(value);
                slot.index = index;
                key
            }
            None => {
                self.slots.push(Slot {
                    value: Some(value),
                    index,
                    generation: 0,
                });
                self.slots.len() - 1
            }
        };

        self.heap.push(key);
        self.shuffle_up(index);

        PrioqHandle {
            key,
            generation: self.slots[key].generation,
        }
    }

    /// Smallest value, if any.
    pub fn peek(&self) -> Option<&T> {
        self.heap.first().and_then(|&key| self.slots[key].value.as_ref())
    }

    /// Handle of the smallest value, if any.
    pub fn peek_handle(&self) -> Option<PrioqHandle> {
        self.heap.first().map(|&key| PrioqHandle {
            key,
            generation: self.slots[key].generation,
        })
    }

    /// Remove and return the smallest value.
    pub fn pop(&mut self) -> Option<T> {
        let handle = self.peek_handle()?;
        Some(self.remove(handle))
    }

    /// Remove the value behind `handle`.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn remove(&mut self, handle: PrioqHandle) -> T {
        match self.try_remove(handle) {
            Some(value) => value,
            None => panic!("stale priority queue handle {handle:?}"),
        }
    }

    /// Remove the value behind `handle`, or `None` if it already left.
    pub fn try_remove(&mut self, handle: PrioqHandle) -> Option<T> {
        if !self.is_live(handle) {
            return None;
        }

        let index = self.slots[handle.key].index;
        let last = self.heap.len() - 1;
        if index != last {
            self.swap(index, last);
        }
        self.heap.pop();

        if index < self.heap.len() {
            // The moved entry may belong above or below its new spot.
            let index = self.shuffle_down(index);
            self.shuffle_up(index);
        }

        let slot = &mut self.slots[handle.key];
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(handle.key);
        slot.value.take()
    }

    /// Restore heap order after the value behind `handle` changed its key.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn reshuffle(&mut self, handle: PrioqHandle) {
        assert!(self.is_live(handle), "stale priority queue handle {handle:?}");
        let index = self.shuffle_down(self.slots[handle.key].index);
        self.shuffle_up(index);
    }

    /// Value behind `handle`, or `None` if it left the queue.
    pub fn get(&self, handle: PrioqHandle) -> Option<&T> {
        if !self.is_live(handle) {
            return None;
        }
        self.slots[handle.key].value.as_ref()
    }

    /// Mutable access to the value behind `handle`.
    ///
    /// Call [`reshuffle`](Self::reshuffle) afterwards if the change affects
    /// ordering.
    pub fn get_mut(&mut self, handle: PrioqHandle) -> Option<&mut T> {
        if !self.is_live(handle) {
            return None;
        }
        self.slots[handle.key].value.as_mut()
    }

    /// Iterate over held values in heap (not sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap
            .iter()
            .filter_map(|&key| self.slots[key].value.as_ref())
    }

    fn is_live(&self, handle: PrioqHandle) -> bool {
        self.slots
            .get(handle.key)
            .is_some_and(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (Some(a), Some(b)) = (
            self.slots[self.heap[a]].value.as_ref(),
            self.slots[self.heap[b]].value.as_ref(),
        ) else {
            return false;
        };
        (self.compare)(a, b) == Ordering::Less
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.slots[self.heap[a]].index = a;
        self.slots[self.heap[b]].index = b;
    }

    /// Move the entry at `index` towards the root. Returns its final index.
    fn shuffle_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index
    }

    /// Move the entry at `index` towards the leaves. Returns its final index.
    fn shuffle_down(&mut self, mut index: usize) -> usize {
        loop {
            let left = index * 2 + 1;
            let right = left + 1;
            if left >= self.heap.len() {
                break;
            }

            let mut smallest = index;
            if self.less(left, smallest) {
                smallest = left;
            }
            if right < self.heap.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }

            self.swap(index, smallest);
            index = smallest;
        }
        index
    }
}

impl<T: std::fmt::Debug, F> std::fmt::Debug for PrioQ<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioQ")
            .field("len", &self.heap.len())
            .field(
                "top",
                &self.heap.first().and_then(|&k| self.slots[k].value.as_ref()),
            )
            .finish()
    }
}
