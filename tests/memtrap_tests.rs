//! Integration tests for SIGBUS containment.
//!
//! These tests provoke real faults: a peer truncates an object we have
//! mapped, and we read past the new end of file.

use sonance::config::ShmConfig;
use sonance::memory::{
    ImportedSegment, MemBlock, MemTrap, MemTrapService, MemorySegment, SharedSegment, page,
};
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::Arc;

const CHILD_ENV: &str = "SONANCE_MEMTRAP_CHILD";

fn test_config(tag: &str) -> ShmConfig {
    ShmConfig::with_prefix(format!("sonance-trap-{}-{tag}", std::process::id()))
}

/// Truncate `/dev/shm/<prefix>-<id>` to zero, as a misbehaving peer would.
fn truncate_object(config: &ShmConfig, id: u32) {
    let path = format!("{}/{}-{id}", sonance::defaults::SHM_DIR, config.prefix);
    OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap()
        .set_len(0)
        .unwrap();
}

/// Map a memfd of `len` bytes shared, then shrink the file under the mapping.
fn truncated_memfd_mapping(len: usize) -> *mut u8 {
    use rustix::fs::{MemfdFlags, ftruncate, memfd_create};
    use rustix::mm::{MapFlags, ProtFlags, mmap};

    let fd = memfd_create("sonance-trap-test", MemfdFlags::CLOEXEC).unwrap();
    ftruncate(&fd, len as u64).unwrap();
    // SAFETY: fresh mapping of our own memfd.
    let ptr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &fd,
            0,
        )
    }
    .unwrap();
    ftruncate(&fd, 0).unwrap();
    ptr.cast()
}

// ============================================================================
// Contained faults
// ============================================================================

#[test]
fn test_truncated_import_reads_zeroes() {
    let config = test_config("import");
    let creator = SharedSegment::create_in(&config, 8 * page::page_size(), true).unwrap();
    let imported = Arc::new(ImportedSegment::attach(&config, creator.id()).unwrap());

    // An unrelated segment from the same peer stays intact
    let other_creator = SharedSegment::create_in(&config, page::page_size(), true).unwrap();
    let other = ImportedSegment::attach(&config, other_creator.id()).unwrap();

    assert!(imported.is_good());
    assert_eq!(imported.marker_pid(), Some(std::process::id()));

    truncate_object(&config, creator.id());

    // SAFETY: the mapping is registered; the fault is contained.
    let byte = unsafe { std::ptr::read_volatile(imported.as_ptr().add(page::page_size())) };
    assert_eq!(byte, 0);
    assert!(!imported.is_good());
    assert!(other.is_good());
    assert_eq!(other.marker_pid(), Some(std::process::id()));

    // The whole range now reads as zero, marker included
    assert_eq!(imported.marker_pid(), None);
    let block = MemBlock::new(Arc::clone(&imported) as Arc<dyn MemorySegment>);
    assert!(!block.is_good());
    assert!(block.to_vec().iter().all(|&b| b == 0));
}

#[test]
fn test_trap_on_raw_mapping() {
    let len = 4 * page::page_size();
    let ptr = truncated_memfd_mapping(len);
    let trap = MemTrap::add(ptr, len).unwrap();
    assert!(trap.is_good());

    // SAFETY: registered range; writes land in the replacement mapping.
    unsafe {
        std::ptr::write_volatile(ptr.add(10), 0x5A);
        assert_eq!(std::ptr::read_volatile(ptr.add(10)), 0x5A);
    }
    assert!(!trap.is_good());

    drop(trap);
    // SAFETY: unmapping the range created above.
    unsafe { rustix::mm::munmap(ptr.cast(), len).unwrap() };
}

#[test]
fn test_updated_trap_covers_new_range() {
    let len = page::page_size();
    let first = truncated_memfd_mapping(len);
    let second = truncated_memfd_mapping(len);

    let mut trap = MemTrap::add(first, len).unwrap();
    trap.update(second, len);
    assert_eq!(trap.start(), second.cast_const());

    // SAFETY: `second` is registered.
    assert_eq!(unsafe { std::ptr::read_volatile(second) }, 0);
    assert!(!trap.is_good());

    // Re-pointing clears the bad flag
    trap.update(first, len);
    assert!(trap.is_good());
    trap.remove();

    // SAFETY: unmapping the ranges created above.
    unsafe {
        rustix::mm::munmap(first.cast(), len).unwrap();
        rustix::mm::munmap(second.cast(), len).unwrap();
    }
}

#[test]
fn test_faults_while_registrations_churn() {
    let service = MemTrapService::global().unwrap();
    let len = page::page_size();

    let churn = std::thread::spawn(move || {
        let region = SharedSegment::create(64 * page::page_size(), false, 0o600).unwrap();
        for i in 0..500 {
            let offset = (i % 64) * page::page_size();
            // SAFETY: in bounds of the private segment.
            let start = unsafe { region.as_ptr().add(offset) };
            let trap = service.add(start, page::page_size()).unwrap();
            assert!(trap.is_good());
        }
    });

    for _ in 0..50 {
        let ptr = truncated_memfd_mapping(len);
        let trap = MemTrap::add(ptr, len).unwrap();
        // SAFETY: registered range.
        assert_eq!(unsafe { std::ptr::read_volatile(ptr) }, 0);
        assert!(!trap.is_good());
        drop(trap);
        // SAFETY: unmapping the range created above.
        unsafe { rustix::mm::munmap(ptr.cast(), len).unwrap() };
    }

    churn.join().unwrap();
}

// ============================================================================
// Unrelated faults
// ============================================================================

#[test]
fn test_unrelated_fault_aborts() {
    if std::env::var_os(CHILD_ENV).is_some() {
        let len = page::page_size();
        let guarded = SharedSegment::create(len, false, 0o600).unwrap();
        let _trap = MemTrap::add(guarded.as_ptr(), len).unwrap();

        let unguarded = truncated_memfd_mapping(len);
        // SAFETY: deliberately faults; the handler must abort the process.
        let _ = unsafe { std::ptr::read_volatile(unguarded) };
        unreachable!("fault outside every trap was swallowed");
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "test_unrelated_fault_aborts", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();

    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to handle SIGBUS"));
}
