//! Process-wide shutdown flag and SIGINT handling.
//!
//! Every long-running loop (both scan passes, the offset run, and the
//! source's `fill` wait) polls [`requested`]. The handler itself touches
//! nothing but async-signal-safe primitives: an atomic flag, `write(2)`,
//! and `_exit`. Latency from signal to observed cancellation is bounded
//! by the 100 ms fill timeout.

use std::sync::atomic::{AtomicBool, Ordering};

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// True once the first SIGINT has been received.
pub fn requested() -> bool {
    EXIT_REQUESTED.load(Ordering::Relaxed)
}

/// Set the exit flag (used by tests and by the signal handler).
pub fn request() {
    EXIT_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn sigint_handler(_signum: libc::c_int) {
    if EXIT_REQUESTED.swap(true, Ordering::Relaxed) {
        // Second Ctrl-C: force immediate termination.
        let msg = b"\nForcing exit.\n";
        unsafe {
            libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
            libc::_exit(1);
        }
    }
    let msg = b"\nSignal received, stopping...\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

/// Install the SIGINT handler. Call once at startup.
pub fn install_handler() {
    let handler = sigint_handler as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}
