//! Signal handling (SIGINT, SIGTERM, SIGHUP).
//!
//! The first signal only sets a flag: the scheduler stops admitting new
//! commands and in-flight children (which receive the terminal's SIGINT
//! themselves) get to wind down, so the final progress output and the log
//! stay coherent.  SA_RESETHAND restores the default disposition, so a
//! second signal kills the process the ordinary way.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_interrupted(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

pub fn register() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = mark_interrupted as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESETHAND;
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    }
}

pub fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}
