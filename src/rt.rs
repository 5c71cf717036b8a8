//! Realtime scheduling for the calling thread.

use crate::error::{Error, Result};

/// Move the calling thread to `SCHED_FIFO` at `priority`.
///
/// Fails without `CAP_SYS_NICE` (or a matching `RLIMIT_RTPRIO`) and for
/// priorities outside the range the kernel accepts. A no-op on platforms
/// without `SCHED_FIFO`.
#[cfg(target_os = "linux")]
pub fn make_realtime(priority: i32) -> Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };

    // SAFETY: `param` is a valid sched_param and tid 0 is the calling thread.
    let result = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };

    if result == -1 {
        let err = std::io::Error::last_os_error();
        return Err(Error::Realtime(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err} \
             (hint: requires CAP_SYS_NICE or RLIMIT_RTPRIO)"
        )));
    }

    tracing::info!(priority, "thread switched to SCHED_FIFO");
    Ok(())
}

/// Move the calling thread to `SCHED_FIFO` at `priority`.
#[cfg(not(target_os = "linux"))]
pub fn make_realtime(_priority: i32) -> Result<()> {
    Ok(())
}
