use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};

/// SCHED_FIFO priority requested for the worker loop.
const RT_PRIORITY: libc::c_int = 12;

/// Best effort: the loop still runs without realtime scheduling, just with
/// weaker latency guarantees.
pub fn set_realtime_priority() {
    let rc = unsafe {
        libc::sched_setscheduler(
            0,
            libc::SCHED_FIFO,
            &libc::sched_param {
                sched_priority: RT_PRIORITY,
            },
        )
    };

    if rc < 0 {
        static WARNED: AtomicBool = AtomicBool::new(false);
        let warned = WARNED.swap(true, Ordering::Relaxed);

        if !warned {
            let err = std::io::Error::last_os_error();

            log::warn!("failed to set realtime scheduling for audio worker: {err}");

            if err.kind() == ErrorKind::PermissionDenied {
                log::warn!("grant CAP_SYS_NICE to enable realtime scheduling");
            }
        }
    }
}
