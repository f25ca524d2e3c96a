//! Interrupt handling via the self-pipe trick.
//!
//! The signal handler only writes one byte to a pipe (the lone
//! async-signal-safe thing to do); a watcher thread blocks on the read
//! end and runs the registered hook.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(_signal: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr().cast(), 1);
        }
    }
}

/// Run `hook` once on the first SIGINT or SIGTERM.
///
/// May only be installed once per process.
pub fn on_interrupt(hook: impl FnOnce() + Send + 'static) -> io::Result<()> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    PIPE_WRITE_FD.store(write_fd, Ordering::Relaxed);

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    thread::spawn(move || {
        let mut byte = [0u8; 1];
        unsafe {
            libc::read(read_fd, byte.as_mut_ptr().cast(), 1);
        }
        hook();
    });
    Ok(())
}
