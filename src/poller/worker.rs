//! Poller worker thread: one bounded descriptor set, one poll(2) loop.

use super::{Interest, ReadyFn};
use std::collections::BTreeSet;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{error, trace};

/// Descriptor sets the worker watches. Mutated by the poller under the
/// worker's own mutex; the worker copies them each iteration.
#[derive(Default)]
struct Sets {
    read: BTreeSet<RawFd>,
    write: BTreeSet<RawFd>,
}

/// Wakeup pipe: writing one byte interrupts the worker's blocking poll.
///
/// Stands in for the source's close-a-UDP-socket alert; the pipe is
/// non-blocking on both ends, so a pending wakeup makes further rings
/// no-ops instead of filling the pipe.
struct Alert {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl Alert {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: pipe2 reported success, so both fds are freshly owned.
        unsafe {
            Ok(Self {
                read_end: OwnedFd::from_raw_fd(fds[0]),
                write_end: OwnedFd::from_raw_fd(fds[1]),
            })
        }
    }

    fn ring(&self) {
        let byte = [1u8];
        // EAGAIN means a wakeup is already pending; nothing else to do.
        unsafe {
            libc::write(self.write_end.as_raw_fd(), byte.as_ptr().cast(), 1);
        }
    }

    fn drain(&self) {
        let mut sink = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_end.as_raw_fd(), sink.as_mut_ptr().cast(), sink.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

struct Shared {
    running: AtomicBool,
    sets: Mutex<Sets>,
    alert: Alert,
    callback: Arc<ReadyFn>,
}

/// One thread managing a bounded subset of the poller's sockets.
pub(super) struct Worker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(super) fn spawn(callback: Arc<ReadyFn>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            sets: Mutex::new(Sets::default()),
            alert: Alert::new()?,
            callback,
        });

        let state = Arc::clone(&shared);
        let thread = thread::spawn(move || run(&state));

        Ok(Self { shared, thread: Some(thread) })
    }

    pub(super) fn add(&self, handle: RawFd, interest: Interest) {
        {
            let mut sets = self.shared.sets.lock().unwrap();
            if interest.is_read() {
                sets.read.insert(handle);
            }
            if interest.is_write() {
                sets.write.insert(handle);
            }
        }
        self.shared.alert.ring();
    }

    /// Drops the handle from both sets. The sleeping syscall is not
    /// interrupted; a removed-then-closed descriptor wakes it by itself.
    pub(super) fn remove(&self, handle: RawFd) {
        let mut sets = self.shared.sets.lock().unwrap();
        sets.read.remove(&handle);
        sets.write.remove(&handle);
    }

    pub(super) fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.alert.ring();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(shared: &Shared) {
    // Rebuilt every iteration from the snapshot; index 0 is the alert pipe.
    let mut fds: Vec<libc::pollfd> = Vec::new();
    let mut watched: Vec<(RawFd, Interest)> = Vec::new();

    while shared.running.load(Ordering::Acquire) {
        fds.clear();
        watched.clear();
        fds.push(libc::pollfd {
            fd: shared.alert.read_end.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });

        {
            let sets = shared.sets.lock().unwrap();
            for &fd in &sets.read {
                let interest = if sets.write.contains(&fd) {
                    Interest::READ.and(Interest::WRITE)
                } else {
                    Interest::READ
                };
                watched.push((fd, interest));
            }
            for &fd in &sets.write {
                if !sets.read.contains(&fd) {
                    watched.push((fd, Interest::WRITE));
                }
            }
        }
        for &(fd, interest) in &watched {
            let mut events = 0;
            if interest.is_read() {
                events |= libc::POLLIN;
            }
            if interest.is_write() {
                events |= libc::POLLOUT;
            }
            fds.push(libc::pollfd { fd, events, revents: 0 });
        }

        let count = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %err, "poll failed");
            continue;
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            shared.alert.drain();
            if count == 1 {
                continue;
            }
        }

        // Surface events in the order the syscall reports them.
        let mut read_ready = Vec::new();
        let mut write_ready = Vec::new();
        for (slot, &(fd, interest)) in fds[1..].iter().zip(&watched) {
            if interest.is_read()
                && slot.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
            {
                read_ready.push(fd);
            }
            if interest.is_write() && slot.revents & libc::POLLOUT != 0 {
                write_ready.push(fd);
            }
        }

        if !read_ready.is_empty() || !write_ready.is_empty() {
            trace!(
                read = read_ready.len(),
                write = write_ready.len(),
                "dispatching readiness batch"
            );
            (shared.callback)(&read_ready, &write_ready);
        }
    }
}
