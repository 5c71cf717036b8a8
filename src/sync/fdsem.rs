//! File-descriptor backed binary semaphore.
//!
//! An [`FdSem`] is a wakeup flag that can also be observed through `poll`,
//! epoll or a tokio reactor. The fast path is a pair of atomics; the eventfd
//! is only written when a waiter has announced itself, so posting to an idle
//! semaphore costs a single compare-and-swap.
//!
//! `post` only touches atomics and `write(2)`, which makes it usable from a
//! signal handler.

use crate::error::Result;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use rustix::event::{EventfdFlags, eventfd};
use rustix::io::Errno;

/// Binary semaphore whose readiness is exposed as a readable descriptor.
pub struct FdSem {
    fd: OwnedFd,
    /// Number of threads blocked in `wait` or between `before_poll` and `after_poll`.
    waiting: AtomicU32,
    signalled: AtomicBool,
    /// Wakeups written to the eventfd and not yet read back.
    in_pipe: AtomicI64,
}

impl FdSem {
    /// Create an unsignalled semaphore.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC)?;
        Ok(Self {
            fd,
            waiting: AtomicU32::new(0),
            signalled: AtomicBool::new(false),
            in_pipe: AtomicI64::new(0),
        })
    }

    /// Set the flag and wake a waiter, if any.
    ///
    /// Async-signal-safe.
    pub fn post(&self) {
        if self
            .signalled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if self.waiting.load(Ordering::Acquire) == 0 {
            return;
        }

        self.in_pipe.fetch_add(1, Ordering::AcqRel);
        let one = 1u64.to_ne_bytes();
        loop {
            match rustix::io::write(&self.fd, &one[..]) {
                Err(Errno::INTR) => continue,
                _ => break,
            }
        }
    }

    /// Block until the flag is set, then clear it.
    pub fn wait(&self) {
        self.flush();

        if self.take() {
            return;
        }

        self.waiting.fetch_add(1, Ordering::AcqRel);
        while !self.take() {
            let n = self.read_counter();
            self.in_pipe.fetch_sub(n, Ordering::AcqRel);
        }
        let prev = self.waiting.fetch_sub(1, Ordering::AcqRel);
        assert!(prev >= 1, "fdsem waiter count underflow");
    }

    /// Clear the flag if it is set. Never blocks.
    pub fn try_wait(&self) -> bool {
        self.flush();
        self.take()
    }

    /// Arm the descriptor before sleeping in `poll`.
    ///
    /// Returns `false` if the flag was already set (and has been consumed);
    /// the caller must not sleep then. Returns `true` once armed, in which
    /// case [`after_poll`](Self::after_poll) must follow the poll.
    pub fn before_poll(&self) -> bool {
        self.flush();

        if self.take() {
            return false;
        }

        self.waiting.fetch_add(1, Ordering::AcqRel);

        if self.take() {
            let prev = self.waiting.fetch_sub(1, Ordering::AcqRel);
            assert!(prev >= 1, "fdsem waiter count underflow");
            return false;
        }
        true
    }

    /// Disarm after `poll` returned. Returns `true` if the flag was set and
    /// has been consumed.
    pub fn after_poll(&self) -> bool {
        let prev = self.waiting.fetch_sub(1, Ordering::AcqRel);
        assert!(prev >= 1, "after_poll without before_poll");

        self.flush();
        self.take()
    }

    /// Wait for the flag from async code.
    ///
    /// At most one task may wait on a given semaphore at a time, since the
    /// descriptor can be registered with the reactor only once.
    pub async fn wait_async(&self) -> Result<()> {
        use tokio::io::Interest;
        use tokio::io::unix::AsyncFd;

        let async_fd = AsyncFd::with_interest(self.fd.as_fd(), Interest::READABLE)?;

        loop {
            if !self.before_poll() {
                return Ok(());
            }

            let armed = Armed(self);
            let readable = async_fd.readable().await;
            let fired = armed.disarm();
            let mut guard = readable?;

            if fired {
                return Ok(());
            }
            guard.clear_ready();
        }
    }

    fn take(&self) -> bool {
        self.signalled
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Read back wakeups nobody consumed.
    fn flush(&self) {
        if self.in_pipe.load(Ordering::Acquire) <= 0 {
            return;
        }

        loop {
            let n = self.read_counter();
            if self.in_pipe.fetch_sub(n, Ordering::AcqRel) <= n {
                break;
            }
        }
    }

    fn read_counter(&self) -> i64 {
        let mut buf = [0u8; 8];
        loop {
            match rustix::io::read(&self.fd, &mut buf[..]) {
                Ok(8) => return u64::from_ne_bytes(buf) as i64,
                Ok(n) => panic!("short eventfd read: {n} bytes"),
                Err(Errno::INTR) => continue,
                Err(e) => panic!("eventfd read failed: {e}"),
            }
        }
    }
}

impl std::fmt::Debug for FdSem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdSem")
            .field("signalled", &self.signalled.load(Ordering::Relaxed))
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish()
    }
}

/// Keeps `before_poll`/`after_poll` paired when an async wait is cancelled.
struct Armed<'a>(&'a FdSem);

impl Armed<'_> {
    fn disarm(self) -> bool {
        let fired = self.0.after_poll();
        std::mem::forget(self);
        fired
    }
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        // Hand a consumed wakeup back to the next waiter.
        if self.0.after_poll() {
            self.0.post();
        }
    }
}

/// The descriptor becomes readable when a post wakes an armed waiter.
impl AsFd for FdSem {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
