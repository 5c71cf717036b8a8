//! Bounded queue between producers and one consumer, with poll integration.
//!
//! [`AsyncQueue`] is a lock-free SPSC ring buffer with two [`FdSem`]s on
//! top: `read` is posted after every push (data available), `write` after
//! every pop (space available). Producers serialize among themselves on a
//! mutex that is never touched by the consumer, so a realtime consumer never
//! contends with anyone.
//!
//! The consumer can sleep in `pop(true)`, or expose the queue to its own
//! event loop through [`get_fd`](AsyncQueue::get_fd),
//! [`read_before_poll`](AsyncQueue::read_before_poll) and
//! [`read_after_poll`](AsyncQueue::read_after_poll).

use crate::defaults::ASYNCQ_DEFAULT_SIZE;
use crate::error::Result;
use crate::sync::FdSem;
use std::cell::UnsafeCell;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

// ============================================================================
// Lock-Free SPSC Ring Buffer
// ============================================================================

/// Cache line size for padding.
const CACHE_LINE: usize = 64;

/// Padded atomic for avoiding false sharing between head and tail.
#[repr(C)]
struct PaddedAtomicUsize {
    value: AtomicUsize,
    _padding: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
}

impl PaddedAtomicUsize {
    fn new(val: usize) -> Self {
        Self {
            value: AtomicUsize::new(val),
            _padding: [0; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
        }
    }

    fn load(&self, order: Ordering) -> usize {
        self.value.load(order)
    }

    fn store(&self, val: usize, order: Ordering) {
        self.value.store(val, order)
    }
}

struct RingBuffer<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    /// Write position (only modified by the producer holding the push lock).
    head: PaddedAtomicUsize,
    /// Read position (only modified by the consumer).
    tail: PaddedAtomicUsize,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots: (0..capacity).map(|_| UnsafeCell::new(None)).collect(),
            mask: capacity - 1,
            head: PaddedAtomicUsize::new(0),
            tail: PaddedAtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        // Tail first: head never falls behind a tail read earlier.
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// Only one producer may call this at a time.
    unsafe fn try_push(&self, value: T) -> std::result::Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= self.capacity() {
            return Err(value);
        }

        // SAFETY: single producer, and the slot is behind the consumer's tail.
        unsafe {
            *self.slots[head & self.mask].get() = Some(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// Only one consumer may call this at a time.
    unsafe fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: single consumer, and the producer published this slot.
        let value = unsafe { (*self.slots[tail & self.mask].get()).take() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        value
    }
}

// ============================================================================
// AsyncQueue
// ============================================================================

/// Bounded, order-preserving queue with one consumer at a time.
pub struct AsyncQueue<T> {
    ring: RingBuffer<T>,
    /// Posted after a push.
    read_fdsem: FdSem,
    /// Posted after a pop.
    write_fdsem: FdSem,
    push_lock: Mutex<()>,
    consuming: AtomicBool,
}

// SAFETY: slot access is serialized by the push lock on the producer side and
// by the `consuming` flag on the consumer side.
unsafe impl<T: Send> Send for AsyncQueue<T> {}
unsafe impl<T: Send> Sync for AsyncQueue<T> {}

/// Marks the consumer side busy for the duration of a pop.
struct ConsumerGuard<'a>(&'a AtomicBool);

impl<'a> ConsumerGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        let busy = flag.swap(true, Ordering::Acquire);
        assert!(!busy, "concurrent consumers on an async queue");
        Self(flag)
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> AsyncQueue<T> {
    /// Create a queue holding up to `size` items.
    ///
    /// `0` selects [`ASYNCQ_DEFAULT_SIZE`]; other sizes are rounded up to a
    /// power of two.
    pub fn new(size: usize) -> Result<Self> {
        let size = if size == 0 {
            ASYNCQ_DEFAULT_SIZE
        } else {
            size.next_power_of_two()
        };

        Ok(Self {
            ring: RingBuffer::new(size),
            read_fdsem: FdSem::new()?,
            write_fdsem: FdSem::new()?,
            push_lock: Mutex::new(()),
            consuming: AtomicBool::new(false),
        })
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of queued items (snapshot).
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns true if nothing is queued (snapshot).
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Enqueue, blocking while the queue is full.
    pub fn push(&self, value: T) {
        let _producer = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut value = value;
        loop {
            // SAFETY: the push lock makes us the only producer.
            match unsafe { self.ring.try_push(value) } {
                Ok(()) => break,
                Err(back) => {
                    value = back;
                    self.write_fdsem.wait();
                }
            }
        }

        self.read_fdsem.post();
    }

    /// Enqueue without waiting. Returns `Err(value)` when full.
    pub fn try_push(&self, value: T) -> std::result::Result<(), T> {
        let _producer = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // SAFETY: the push lock makes us the only producer.
        unsafe { self.ring.try_push(value) }?;
        self.read_fdsem.post();
        Ok(())
    }

    /// Dequeue the oldest item.
    ///
    /// With `wait` the call sleeps until an item arrives; without it the
    /// call never blocks.
    ///
    /// # Panics
    ///
    /// Panics if another thread is popping concurrently.
    pub fn pop(&self, wait: bool) -> Option<T> {
        let _consumer = ConsumerGuard::acquire(&self.consuming);

        loop {
            // SAFETY: the consumer guard makes us the only consumer.
            if let Some(value) = unsafe { self.ring.try_pop() } {
                self.write_fdsem.post();
                return Some(value);
            }

            if !wait {
                return None;
            }
            self.read_fdsem.wait();
        }
    }

    /// Descriptor that turns readable when items arrive while armed.
    pub fn get_fd(&self) -> BorrowedFd<'_> {
        self.read_fdsem.as_fd()
    }

    /// Arm the read descriptor before the consumer sleeps in `poll`.
    ///
    /// Returns `false` if items are already pending and the caller should
    /// process them instead of sleeping. Returns `true` once armed; the
    /// caller must then call [`read_after_poll`](Self::read_after_poll).
    pub fn read_before_poll(&self) -> bool {
        loop {
            if !self.ring.is_empty() {
                return false;
            }
            if self.read_fdsem.before_poll() {
                return true;
            }
        }
    }

    /// Disarm after `poll` returned.
    pub fn read_after_poll(&self) {
        self.read_fdsem.after_poll();
    }
}

impl<T> std::fmt::Debug for AsyncQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_asyncq_fifo() {
        let q = AsyncQueue::new(4).unwrap();
        assert!(q.is_empty());
        assert_eq!(q.capacity(), 4);

        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);

        assert_eq!(q.pop(false), Some(1));
        assert_eq!(q.pop(false), Some(2));
        assert_eq!(q.pop(false), Some(3));
        assert_eq!(q.pop(false), None);
    }

    #[test]
    fn test_asyncq_size_rounding() {
        assert_eq!(AsyncQueue::<u8>::new(0).unwrap().capacity(), ASYNCQ_DEFAULT_SIZE);
        assert_eq!(AsyncQueue::<u8>::new(5).unwrap().capacity(), 8);
        assert_eq!(AsyncQueue::<u8>::new(1).unwrap().capacity(), 1);
    }

    #[test]
    fn test_asyncq_try_push_full() {
        let q = AsyncQueue::new(2).unwrap();
        q.try_push("a").unwrap();
        q.try_push("b").unwrap();
        assert_eq!(q.try_push("c"), Err("c"));

        assert_eq!(q.pop(false), Some("a"));
        q.try_push("c").unwrap();
    }

    #[test]
    fn test_asyncq_backpressure_is_lossless() {
        const N: u32 = 10_000;
        let q = Arc::new(AsyncQueue::new(4).unwrap());
        let producer_q = Arc::clone(&q);

        let producer = thread::spawn(move || {
            for i in 0..N {
                producer_q.push(i);
            }
        });

        for expected in 0..N {
            assert_eq!(q.pop(true), Some(expected));
        }
        producer.join().unwrap();
        assert_eq!(q.pop(false), None);
    }

    #[test]
    fn test_asyncq_poll_integration() {
        let q = Arc::new(AsyncQueue::new(4).unwrap());

        // Pending item: do not sleep
        q.push(7);
        assert!(!q.read_before_poll());
        assert_eq!(q.pop(false), Some(7));

        // Empty: arm and wait for a producer
        assert!(q.read_before_poll());
        let producer_q = Arc::clone(&q);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer_q.push(8);
        });

        let mut fds = [rustix::event::PollFd::from_borrowed_fd(
            q.get_fd(),
            rustix::event::PollFlags::IN,
        )];
        assert_eq!(rustix::event::poll(&mut fds, None).unwrap(), 1);
        q.read_after_poll();

        assert_eq!(q.pop(false), Some(8));
        producer.join().unwrap();
    }

    #[test]
    fn test_asyncq_drops_pending() {
        let marker = Arc::new(());
        {
            let q = AsyncQueue::new(4).unwrap();
            q.push(Arc::clone(&marker));
            q.push(Arc::clone(&marker));
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_asyncq_len_never_exceeds_capacity() {
        let q = Arc::new(AsyncQueue::new(4).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        let producer = {
            let q = Arc::clone(&q);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = q.try_push(0u8);
                }
            })
        };
        let consumer = {
            let q = Arc::clone(&q);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    q.pop(false);
                }
            })
        };

        for _ in 0..200_000 {
            assert!(q.len() <= q.capacity());
        }
        stop.store(true, Ordering::Relaxed);
        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
