//! POSIX shared memory segments with an owner liveness marker.
//!
//! A shared segment is a named object `/<prefix>-<id>` under `/dev/shm`,
//! mapped read-write by exactly one creator and read-only by any number of
//! peers. The last bytes of every shared mapping hold a marker with a magic
//! value and the creator's PID, so [`SharedSegment::cleanup`] can find and
//! unlink objects whose creator died without removing them.
//!
//! Non-shared segments are private anonymous mappings behind the same
//! interface (id 0, no marker).
//!
//! # Example
//!
//! ```rust,ignore
//! use sonance::memory::SharedSegment;
//!
//! let writer = SharedSegment::create(64 * 1024, true, 0o700)?;
//! // Hand writer.id() to a peer, which calls:
//! let reader = SharedSegment::attach_ro(writer.id())?;
//! ```

use super::page::{is_page_aligned, page_align, page_align_down};
use super::{MemorySegment, MemoryType};
use crate::config::ShmConfig;
use crate::defaults::{MAX_SHM_SIZE, SHM_DIR, SHM_MARKER_MAGIC};
use crate::error::{Error, Result};
use crate::observability::{
    record_segment_created, record_segment_reaped, record_segment_unmapped, trace_segment_reaped,
};
use rustix::mm::{Advice, MapFlags, ProtFlags};
use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Trailing marker of a shared segment.
#[repr(C)]
struct ShmMarker {
    magic: AtomicU32,
    pid: AtomicU32,
    _reserved: [u64; 4],
}

/// Bytes reserved at the end of every shared mapping for the marker.
pub const MARKER_SIZE: usize = std::mem::size_of::<ShmMarker>().next_multiple_of(8);

fn segment_name(prefix: &str, id: u32) -> String {
    format!("/{prefix}-{id}")
}

/// Parse `<prefix>-<decimal id>`; anything else is not ours.
fn parse_segment_id(prefix: &str, file_name: &str) -> Option<u32> {
    let digits = file_name.strip_prefix(prefix)?.strip_prefix('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn shm_open(name: &str, flags: libc::c_int, mode: u32) -> io::Result<OwnedFd> {
    let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `cname` is a valid NUL-terminated string.
    let fd = unsafe { libc::shm_open(cname.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: shm_open returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn shm_unlink(name: &str) -> io::Result<()> {
    let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `cname` is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(cname.as_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Zero-signal liveness probe. Only a definite ESRCH counts as dead.
fn owner_is_dead(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return false;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

fn map_fd(fd: &OwnedFd, len: usize, writable: bool) -> Result<NonNull<u8>> {
    let prot = if writable {
        ProtFlags::READ | ProtFlags::WRITE
    } else {
        ProtFlags::READ
    };

    // SAFETY: a fresh shared mapping of an object we hold open; nothing
    // aliases the returned range yet.
    let ptr = unsafe { rustix::mm::mmap(std::ptr::null_mut(), len, prot, MapFlags::SHARED, fd, 0) }
        .map_err(|e| Error::AllocationFailed(format!("mmap of {len} bytes: {e}")))?;

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))
}

/// One shared or private memory mapping.
pub struct SharedSegment {
    /// Random object id, 0 for private segments.
    id: u32,
    ptr: NonNull<u8>,
    /// Bytes mapped, marker included.
    mapped_len: usize,
    /// Usable bytes, marker excluded.
    data_len: usize,
    shared: bool,
    writable: bool,
    do_unlink: bool,
    prefix: String,
}

// SAFETY: the mapping lives as long as the segment; byte-level access is the
// caller's contract, as for every `MemorySegment`.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a segment of at least `size` usable bytes with the default prefix.
    ///
    /// See [`create_in`](Self::create_in).
    pub fn create(size: usize, shared: bool, mode: u32) -> Result<Self> {
        Self::create_in(&ShmConfig::default().with_mode(mode), size, shared)
    }

    /// Create a segment of at least `size` usable bytes.
    ///
    /// Private segments are anonymous mappings. Shared segments get a fresh
    /// random id, an object sized to hold `size` bytes plus the marker, and
    /// a marker stamped with our PID. A [`cleanup_in`](Self::cleanup_in)
    /// pass runs first.
    ///
    /// # Errors
    ///
    /// - [`Error::AllocationFailed`] if `size` is 0 or mapping fails
    /// - [`Error::SegmentTooLarge`] if `size` exceeds [`MAX_SHM_SIZE`]
    pub fn create_in(config: &ShmConfig, size: usize, shared: bool) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }
        if size > MAX_SHM_SIZE {
            return Err(Error::SegmentTooLarge {
                size,
                max: MAX_SHM_SIZE,
            });
        }

        if !shared {
            return Self::create_private(size, &config.prefix);
        }

        if let Err(e) = Self::cleanup_in(config) {
            debug!(error = %e, "stale segment sweep failed");
        }

        let mapped_len = page_align(size + MARKER_SIZE);

        let (id, name, fd) = loop {
            let id: u32 = rand::random();
            if id == 0 {
                continue;
            }
            let name = segment_name(&config.prefix, id);
            match shm_open(&name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, config.mode) {
                Ok(fd) => break (id, name, fd),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => continue,
                Err(e) => {
                    warn!(name = %name, error = %e, "shm_open failed");
                    return Err(e.into());
                }
            }
        };

        let mapped = rustix::fs::ftruncate(&fd, mapped_len as u64)
            .map_err(Error::from)
            .and_then(|()| map_fd(&fd, mapped_len, true));

        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(e) => {
                warn!(name = %name, error = %e, "failed to size or map shared segment");
                if let Err(e) = shm_unlink(&name) {
                    warn!(name = %name, error = %e, "shm_unlink failed");
                }
                return Err(e);
            }
        };

        let segment = Self {
            id,
            ptr,
            mapped_len,
            data_len: mapped_len - MARKER_SIZE,
            shared: true,
            writable: true,
            do_unlink: true,
            prefix: config.prefix.clone(),
        };

        let marker = segment.marker();
        marker.pid.store(std::process::id(), Ordering::Release);
        marker.magic.store(SHM_MARKER_MAGIC, Ordering::Release);

        record_segment_created(true, mapped_len);
        debug!(id, size = mapped_len, "created shared memory segment");
        Ok(segment)
    }

    fn create_private(size: usize, prefix: &str) -> Result<Self> {
        let len = page_align(size);

        // SAFETY: a fresh anonymous mapping; nothing aliases it.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .map_err(|e| {
            warn!(size = len, error = %e, "private mmap failed");
            Error::AllocationFailed(format!("mmap of {len} bytes: {e}"))
        })?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        record_segment_created(false, len);
        Ok(Self {
            id: 0,
            ptr,
            mapped_len: len,
            data_len: len,
            shared: false,
            writable: true,
            do_unlink: false,
            prefix: prefix.to_string(),
        })
    }

    /// Attach a peer's segment read-only, using the default prefix.
    pub fn attach_ro(id: u32) -> Result<Self> {
        Self::attach_ro_in(&ShmConfig::default(), id)
    }

    /// Attach the segment `/<prefix>-<id>` read-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSegment`] if the object's size is zero, over
    /// the cap, or not a page multiple. Such objects are foreign, still
    /// being created, or corrupt.
    pub fn attach_ro_in(config: &ShmConfig, id: u32) -> Result<Self> {
        let name = segment_name(&config.prefix, id);

        let fd = shm_open(&name, libc::O_RDONLY, 0).map_err(|e| {
            debug!(name = %name, error = %e, "shm_open failed");
            Error::from(e)
        })?;

        let size = rustix::fs::fstat(&fd)?.st_size;
        let max = page_align(MAX_SHM_SIZE + MARKER_SIZE);
        let valid = usize::try_from(size)
            .ok()
            .filter(|&s| s > 0 && s <= max && is_page_aligned(s));
        let Some(mapped_len) = valid else {
            debug!(name = %name, size, "rejecting shared segment with invalid size");
            return Err(Error::InvalidSegment(format!(
                "{name}: invalid size {size}"
            )));
        };

        let ptr = map_fd(&fd, mapped_len, false).inspect_err(|e| {
            debug!(name = %name, error = %e, "mmap failed");
        })?;

        Ok(Self {
            id,
            ptr,
            mapped_len,
            data_len: mapped_len - MARKER_SIZE,
            shared: true,
            writable: false,
            do_unlink: false,
            prefix: config.prefix.clone(),
        })
    }

    /// Object id; 0 for private segments.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bytes mapped, including the marker.
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    /// Returns true for named shared segments.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Returns true if this mapping may be written.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// PID stamped into the marker, if the marker is ours.
    pub fn marker_pid(&self) -> Option<u32> {
        if !self.shared {
            return None;
        }
        let marker = self.marker();
        (marker.magic.load(Ordering::Acquire) == SHM_MARKER_MAGIC)
            .then(|| marker.pid.load(Ordering::Acquire))
    }

    fn marker(&self) -> &ShmMarker {
        debug_assert!(self.shared);
        // SAFETY: shared mappings are at least one page, page sizes are
        // multiples of 8, and the marker occupies the last MARKER_SIZE bytes.
        unsafe {
            &*self
                .ptr
                .as_ptr()
                .add(self.mapped_len - MARKER_SIZE)
                .cast::<ShmMarker>()
        }
    }

    /// Hint that `[offset, offset + size)` no longer holds useful data.
    ///
    /// Only whole pages inside the range are released. The contents of the
    /// range are unspecified afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the segment is read-only or the range is out of bounds.
    pub fn punch(&self, offset: usize, size: usize) {
        assert!(self.writable, "punch on a read-only segment");
        assert!(
            offset
                .checked_add(size)
                .is_some_and(|end| end <= self.data_len),
            "punch range out of bounds"
        );

        let base = self.ptr.as_ptr() as usize;
        let start = page_align(base + offset);
        let end = page_align_down(base + offset + size);
        if start >= end {
            return;
        }

        for advice in [Advice::LinuxRemove, Advice::LinuxFree, Advice::LinuxDontNeed] {
            // SAFETY: the range lies within our own writable mapping, and the
            // caller gave up its contents.
            if unsafe { rustix::mm::madvise(start as *mut _, end - start, advice) }.is_ok() {
                return;
            }
        }
    }

    /// Sweep orphaned segments with the default prefix.
    pub fn cleanup() -> Result<usize> {
        Self::cleanup_in(&ShmConfig::default())
    }

    /// Unlink every `<prefix>-<id>` object whose creator no longer exists.
    ///
    /// Objects with an unrecognized marker magic, a zero PID, or a live
    /// owner are left alone. Returns the number of objects removed. Only
    /// read-only mappings are used, so concurrent sweeps and concurrent
    /// segment creation are harmless.
    pub fn cleanup_in(config: &ShmConfig) -> Result<usize> {
        let entries = match std::fs::read_dir(SHM_DIR) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(id) = file_name
                .to_str()
                .and_then(|n| parse_segment_id(&config.prefix, n))
            else {
                continue;
            };

            let Ok(segment) = Self::attach_ro_in(config, id) else {
                continue;
            };
            let marker = segment.marker();
            let magic = marker.magic.load(Ordering::Acquire);
            let pid = marker.pid.load(Ordering::Acquire);
            drop(segment);

            if magic != SHM_MARKER_MAGIC || pid == 0 || !owner_is_dead(pid) {
                continue;
            }

            let name = segment_name(&config.prefix, id);
            match shm_unlink(&name) {
                Ok(()) => {
                    trace_segment_reaped(&config.prefix, id, pid);
                    removed += 1;
                }
                Err(e) if matches!(e.raw_os_error(), Some(libc::EACCES | libc::ENOENT)) => {}
                Err(e) => warn!(name = %name, error = %e, "failed to remove orphaned segment"),
            }
        }

        if removed > 0 {
            record_segment_reaped(&config.prefix, removed);
        }
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn set_marker(&self, magic: u32, pid: u32) {
        assert!(self.shared && self.writable);
        let marker = self.marker();
        marker.magic.store(magic, Ordering::Release);
        marker.pid.store(pid, Ordering::Release);
    }
}

impl MemorySegment for SharedSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.writable.then_some(self.ptr.as_ptr())
    }

    fn len(&self) -> usize {
        self.data_len
    }

    fn memory_type(&self) -> MemoryType {
        match (self.shared, self.writable) {
            (false, _) => MemoryType::Private,
            (true, true) => MemoryType::Shared,
            (true, false) => MemoryType::Imported,
        }
    }

    fn shm_id(&self) -> Option<u32> {
        self.shared.then_some(self.id)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the range we mapped; no borrows outlive `self`.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.mapped_len) } {
            warn!(id = self.id, error = %e, "munmap failed");
        }

        if self.writable {
            record_segment_unmapped(self.mapped_len);
        }

        if self.do_unlink {
            let name = segment_name(&self.prefix, self.id);
            match shm_unlink(&name) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    debug!(name = %name, "segment already unlinked");
                }
                Err(e) => warn!(name = %name, error = %e, "shm_unlink failed"),
            }
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("id", &self.id)
            .field("len", &self.data_len)
            .field("shared", &self.shared)
            .field("writable", &self.writable)
            .finish()
    }
}
