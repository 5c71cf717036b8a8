//! SIGBUS containment for memory shared with untrusted peers.
//!
//! A peer that truncates a shared object we have mapped turns every later
//! access to the vanished pages into SIGBUS. Registering the mapping with a
//! [`MemTrap`] makes the process survive that: the handler finds the range,
//! marks the registration bad, maps zero-filled anonymous memory over it
//! with `MAP_FIXED` and lets the faulting instruction retry. The owner then
//! checks [`MemTrap::is_good`] and drops the data.
//!
//! Faults outside every registered range are not ours: the handler writes a
//! message to stderr and aborts.
//!
//! # Concurrency
//!
//! The handler runs in signal context and must never block, so it reads the
//! registrations without a lock. Registrations live in two lists, one per
//! generation. A shared counter holds the active generation in its top bit
//! and the number of readers inside the handler in the remaining bits.
//! Writers serialize on a mutex, edit the inactive list, wait for readers of
//! the active list to drain, flip the generation with a CAS, then repeat the
//! edit on the list that just became inactive.

use crate::error::{Error, Result};
use crate::memory::page::is_page_aligned;
use crate::observability::record_memtrap_registrations;
use crate::sync::FdSem;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::debug;

const MSB: u32 = 1 << 31;

#[inline]
fn which(n: u32) -> usize {
    usize::from(n & MSB != 0)
}

#[inline]
fn counter(n: u32) -> u32 {
    n & !MSB
}

/// One registered range, linked into both generation lists.
struct TrapNode {
    start: AtomicUsize,
    size: AtomicUsize,
    bad: AtomicBool,
    next: [AtomicPtr<TrapNode>; 2],
    prev: [AtomicPtr<TrapNode>; 2],
}

impl TrapNode {
    fn new(start: usize, size: usize) -> Self {
        Self {
            start: AtomicUsize::new(start),
            size: AtomicUsize::new(size),
            bad: AtomicBool::new(false),
            next: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
            prev: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
        }
    }
}

static SERVICE: OnceLock<MemTrapService> = OnceLock::new();

/// The service the signal handler reads; set before the handler is installed.
static HANDLER_SERVICE: AtomicPtr<MemTrapService> = AtomicPtr::new(ptr::null_mut());

/// Process-wide registry of trapped ranges and owner of the SIGBUS handler.
///
/// There is exactly one instance, reached through [`global`](Self::global).
/// The handler is installed with the first registration and the default
/// disposition is restored when the last one is removed.
pub struct MemTrapService {
    heads: [AtomicPtr<TrapNode>; 2],
    /// MSB: active generation. Remaining bits: readers inside the handler.
    read_lock: AtomicU32,
    /// Posted by the handler after it leaves, so writers can re-check `read_lock`.
    drained: FdSem,
    /// Serializes writers; holds the number of live registrations.
    write_lock: Mutex<usize>,
}

// SAFETY: list nodes are only mutated under `write_lock`; the handler only
// reads them through atomics, and the generation protocol keeps freed nodes
// out of any list a reader can be traversing.
unsafe impl Send for MemTrapService {}
unsafe impl Sync for MemTrapService {}

impl MemTrapService {
    /// The process-wide service, created on first use.
    pub fn global() -> Result<&'static MemTrapService> {
        if let Some(service) = SERVICE.get() {
            return Ok(service);
        }
        let service = MemTrapService {
            heads: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
            read_lock: AtomicU32::new(0),
            drained: FdSem::new()?,
            write_lock: Mutex::new(0),
        };
        Ok(SERVICE.get_or_init(|| service))
    }

    /// Number of live registrations.
    pub fn registrations(&self) -> usize {
        *self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `[start, start + size)`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is null, `size` is zero, or either is not page aligned.
    pub fn add(&'static self, start: *const u8, size: usize) -> Result<MemTrap> {
        assert_range(start, size);

        let mut live = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if *live == 0 {
            HANDLER_SERVICE.store(ptr::from_ref(self).cast_mut(), Ordering::Release);
            install_handler(true)?;
            debug!("installed SIGBUS handler");
        }

        let node = NonNull::from(Box::leak(Box::new(TrapNode::new(start as usize, size))));

        let n = self.read_lock.load(Ordering::Acquire);
        let j = which(n);
        self.link(node, 1 - j);
        self.swap(n);
        self.link(node, j);

        *live += 1;
        record_memtrap_registrations(*live);

        Ok(MemTrap {
            node,
            service: self,
        })
    }

    fn remove(&self, node: NonNull<TrapNode>) {
        let mut live = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.unlink_both(node);

        // SAFETY: the node is in neither list and no reader can still hold it
        // (see `unlink_both`); it came from `Box::leak` in `add`.
        drop(unsafe { Box::from_raw(node.as_ptr()) });

        *live -= 1;
        record_memtrap_registrations(*live);

        if *live == 0 {
            match install_handler(false) {
                Ok(()) => debug!("restored default SIGBUS disposition"),
                Err(e) => tracing::warn!(error = %e, "failed to reset SIGBUS handler"),
            }
        }
    }

    fn update(&self, node: NonNull<TrapNode>, start: *const u8, size: usize) {
        assert_range(start, size);

        let _live = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // SAFETY: the node stays alive while its MemTrap handle exists.
        let m = unsafe { node.as_ref() };
        if m.start.load(Ordering::Relaxed) == start as usize
            && m.size.load(Ordering::Relaxed) == size
        {
            return;
        }

        self.unlink_both(node);

        m.start.store(start as usize, Ordering::Release);
        m.size.store(size, Ordering::Release);
        m.bad.store(false, Ordering::Release);

        let n = self.read_lock.load(Ordering::Acquire);
        let j = which(n);
        self.link(node, 1 - j);
        self.swap(n);
        self.link(node, j);
    }

    /// Take `node` out of both lists. On return no reader can reach it.
    fn unlink_both(&self, node: NonNull<TrapNode>) {
        let n = self.read_lock.load(Ordering::Acquire);
        let j = which(n);
        self.unlink(node, 1 - j);
        self.swap(n);
        self.unlink(node, j);
    }

    /// Flip the active generation once no reader is left in it.
    fn swap(&self, mut n: u32) {
        loop {
            if counter(n) > 0 {
                self.drained.wait();
            } else if self
                .read_lock
                .compare_exchange(n, n ^ MSB, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            n = self.read_lock.load(Ordering::Acquire);
        }
    }

    fn link(&self, node: NonNull<TrapNode>, j: usize) {
        // SAFETY: called under the write lock on live nodes.
        let m = unsafe { node.as_ref() };
        let head = self.heads[j].load(Ordering::Relaxed);

        m.prev[j].store(ptr::null_mut(), Ordering::Relaxed);
        m.next[j].store(head, Ordering::Relaxed);
        if let Some(head) = NonNull::new(head) {
            // SAFETY: list members are live while linked.
            unsafe { head.as_ref() }.prev[j].store(node.as_ptr(), Ordering::Relaxed);
        }
        self.heads[j].store(node.as_ptr(), Ordering::Release);
    }

    fn unlink(&self, node: NonNull<TrapNode>, j: usize) {
        // SAFETY: called under the write lock on live nodes.
        let m = unsafe { node.as_ref() };
        let next = m.next[j].load(Ordering::Relaxed);
        let prev = m.prev[j].load(Ordering::Relaxed);

        if let Some(next) = NonNull::new(next) {
            // SAFETY: list members are live while linked.
            unsafe { next.as_ref() }.prev[j].store(prev, Ordering::Relaxed);
        }
        match NonNull::new(prev) {
            // SAFETY: list members are live while linked.
            Some(prev) => unsafe { prev.as_ref() }.next[j].store(next, Ordering::Release),
            None => self.heads[j].store(next, Ordering::Release),
        }
    }

    /// Scan the active list for `addr`. Runs in signal context.
    fn handle_fault(&self, addr: usize) -> bool {
        let n = self.read_lock.fetch_add(1, Ordering::AcqRel);
        let j = which(n);

        let mut cursor = self.heads[j].load(Ordering::Acquire);
        let mut handled = false;
        while let Some(node) = NonNull::new(cursor) {
            // SAFETY: nodes in the active list stay allocated until every
            // reader counted in `read_lock` has left.
            let m = unsafe { node.as_ref() };
            let start = m.start.load(Ordering::Acquire);
            let size = m.size.load(Ordering::Acquire);

            if addr >= start && addr < start + size {
                m.bad.store(true, Ordering::Release);
                handled = remap_zero(start, size);
                if !handled {
                    sigsafe_error(b"sonance: mmap() over trapped range failed\n");
                }
                break;
            }
            cursor = m.next[j].load(Ordering::Acquire);
        }

        self.read_lock.fetch_sub(1, Ordering::AcqRel);
        self.drained.post();
        handled
    }
}

fn assert_range(start: *const u8, size: usize) {
    assert!(!start.is_null(), "memtrap range must not be null");
    assert!(size > 0, "memtrap range must not be empty");
    assert!(
        is_page_aligned(start as usize) && is_page_aligned(size),
        "memtrap range must be page aligned"
    );
}

/// Replace `[start, start + size)` with zero-filled private memory.
fn remap_zero(start: usize, size: usize) -> bool {
    // SAFETY: the range is a registered mapping whose backing object is gone;
    // replacing it in place is the point.
    let r = unsafe {
        rustix::mm::mmap_anonymous(
            start as *mut c_void,
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE | MapFlags::FIXED,
        )
    };
    matches!(r, Ok(p) if p as usize == start)
}

fn sigsafe_error(msg: &[u8]) {
    // SAFETY: write(2) is async-signal-safe and `msg` is a valid buffer.
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    }
}

extern "C" fn sigbus_handler(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    let service = HANDLER_SERVICE.load(Ordering::Acquire);

    if !service.is_null() && !info.is_null() {
        // SAFETY: the kernel hands us a valid siginfo for SA_SIGINFO handlers,
        // and the service is a 'static set before installation.
        let (service, addr) = unsafe { (&*service, (*info).si_addr() as usize) };
        if service.handle_fault(addr) {
            return;
        }
    }

    sigsafe_error(b"sonance: failed to handle SIGBUS\n");
    // SAFETY: abort(3) is async-signal-safe.
    unsafe { libc::abort() }
}

/// Install our handler (`true`) or restore the default disposition.
fn install_handler(ours: bool) -> Result<()> {
    // SAFETY: a zeroed sigaction is a valid starting point; every field we
    // rely on is set explicitly below.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };

    if ours {
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) =
            sigbus_handler;
        sa.sa_sigaction = handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    } else {
        sa.sa_sigaction = libc::SIG_DFL;
    }

    // SAFETY: `sa` is initialized; the old action is not requested.
    let rc = unsafe {
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGBUS, &sa, ptr::null_mut())
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// A registered range. Dropping the handle unregisters it.
pub struct MemTrap {
    node: NonNull<TrapNode>,
    service: &'static MemTrapService,
}

// SAFETY: the node is only touched through atomics or under the service lock.
unsafe impl Send for MemTrap {}
unsafe impl Sync for MemTrap {}

impl MemTrap {
    /// Register `[start, start + size)` with the global service.
    ///
    /// # Panics
    ///
    /// Panics if `start` is null, `size` is zero, or either is not page aligned.
    pub fn add(start: *const u8, size: usize) -> Result<Self> {
        MemTrapService::global()?.add(start, size)
    }

    fn node(&self) -> &TrapNode {
        // SAFETY: the node lives until this handle is dropped.
        unsafe { self.node.as_ref() }
    }

    /// False once a fault hit this range. Never resets on its own.
    pub fn is_good(&self) -> bool {
        !self.node().bad.load(Ordering::Acquire)
    }

    /// Start of the registered range.
    pub fn start(&self) -> *const u8 {
        self.node().start.load(Ordering::Acquire) as *const u8
    }

    /// Size of the registered range.
    pub fn size(&self) -> usize {
        self.node().size.load(Ordering::Acquire)
    }

    /// Re-point this registration at a new range and clear the bad flag.
    ///
    /// A no-op if the range is unchanged.
    pub fn update(&mut self, start: *const u8, size: usize) {
        self.service.update(self.node, start, size);
    }

    /// Unregister. Same as dropping the handle.
    pub fn remove(self) {
        drop(self);
    }
}

impl Drop for MemTrap {
    fn drop(&mut self) {
        self.service.remove(self.node);
    }
}

impl std::fmt::Debug for MemTrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTrap")
            .field("start", &self.start())
            .field("size", &self.size())
            .field("good", &self.is_good())
            .finish()
    }
}
