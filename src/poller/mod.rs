//! Scalable readiness multiplexer.
//!
//! Descriptors are sharded across a fleet of worker threads, each running
//! an independent poll(2) loop over a bounded set, so no single thread
//! scans every socket on every readiness change. Placement favors the
//! least-loaded worker; new workers spawn along a quadratic capacity curve
//! so early sockets cluster instead of fanning out one per thread.

mod worker;

use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use tracing::debug;
use worker::Worker;

/// Readiness callback: invoked on a worker thread with the batch of
/// read-ready and write-ready handles, in syscall report order.
pub type ReadyFn = dyn Fn(&[RawFd], &[RawFd]) + Send + Sync;

/// Which readiness events a handle is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    read: bool,
    write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };

    pub fn and(self, other: Interest) -> Interest {
        Interest { read: self.read || other.read, write: self.write || other.write }
    }

    pub fn is_read(self) -> bool {
        self.read
    }

    pub fn is_write(self) -> bool {
        self.write
    }
}

/// Worker fleet bookkeeping. The socket→worker map is authoritative; the
/// load index mirrors it. Both live under one mutex so every add/remove is
/// a single critical section.
struct Fleet {
    workers: HashMap<usize, Worker>,
    /// (load, worker id), ordered so the least-loaded worker is first.
    by_load: BTreeSet<(usize, usize)>,
    load_of: HashMap<usize, usize>,
    owner: HashMap<RawFd, usize>,
    next_id: usize,
}

/// Fan-out readiness multiplexer over a fleet of poll(2) workers.
pub struct Poller {
    callback: Arc<ReadyFn>,
    max_sockets: usize,
    worker_size: usize,
    max_workers: usize,
    fleet: Mutex<Fleet>,
}

impl Poller {
    /// Build a poller for up to `max_sockets` handles.
    ///
    /// `worker_size` is the requested per-worker set size; it is shrunk if
    /// needed so at least `min_workers` workers can share `max_sockets`.
    /// Fails on a zero `max_sockets` or a zero derived worker size.
    pub fn new(
        callback: Arc<ReadyFn>,
        max_sockets: usize,
        worker_size: usize,
        min_workers: usize,
    ) -> Result<Self> {
        if max_sockets == 0 {
            return Err(Error::InvalidInput(
                "invalid poller max socket count, expected > 0".to_string(),
            ));
        }
        let worker_size = effective_worker_size(max_sockets, worker_size, min_workers);
        if worker_size == 0 {
            return Err(Error::InvalidInput(
                "invalid poller worker size, expected > 0".to_string(),
            ));
        }
        let max_workers = max_sockets.div_ceil(worker_size);

        Ok(Self {
            callback,
            max_sockets,
            worker_size,
            max_workers,
            fleet: Mutex::new(Fleet {
                workers: HashMap::new(),
                by_load: BTreeSet::new(),
                load_of: HashMap::new(),
                owner: HashMap::new(),
                next_id: 0,
            }),
        })
    }

    /// Register a handle for the given events. Idempotent: a handle that is
    /// already watched is left untouched. Fails when the poller is full.
    pub fn add(&self, handle: RawFd, interest: Interest) -> Result<()> {
        let mut fleet = self.fleet.lock().unwrap();

        if fleet.owner.contains_key(&handle) {
            return Ok(());
        }
        if fleet.owner.len() == self.max_sockets {
            return Err(Error::InvalidInput(format!(
                "poller is full ({} sockets)",
                self.max_sockets
            )));
        }

        // Spawn a worker when none exist, or when the fleet has filled past
        // the capacity curve: workers² · (worker_size / max_workers).
        let socket_count = fleet.owner.len();
        let worker_count = fleet.workers.len();
        let level_size = self.worker_size / self.max_workers;
        let spawn_bar = worker_count * worker_count * level_size;
        let id = if worker_count == 0
            || (socket_count > spawn_bar && worker_count < self.max_workers)
        {
            let id = fleet.next_id;
            fleet.next_id += 1;
            let worker = Worker::spawn(Arc::clone(&self.callback))?;
            fleet.workers.insert(id, worker);
            fleet.by_load.insert((0, id));
            fleet.load_of.insert(id, 0);
            debug!(worker = id, workers = worker_count + 1, "spawned poller worker");
            id
        } else {
            let &(_, id) = fleet.by_load.iter().next().expect("fleet has workers");
            id
        };

        let load = fleet.load_of[&id];
        fleet.by_load.remove(&(load, id));
        fleet.by_load.insert((load + 1, id));
        fleet.load_of.insert(id, load + 1);
        fleet.owner.insert(handle, id);

        fleet.workers[&id].add(handle, interest);
        Ok(())
    }

    /// Drop a handle from the poller. Unknown handles are ignored.
    pub fn remove(&self, handle: RawFd) {
        let mut fleet = self.fleet.lock().unwrap();

        let Some(id) = fleet.owner.remove(&handle) else {
            return;
        };
        fleet.workers[&id].remove(handle);

        let load = fleet.load_of[&id];
        fleet.by_load.remove(&(load, id));
        fleet.by_load.insert((load.saturating_sub(1), id));
        fleet.load_of.insert(id, load.saturating_sub(1));
    }

    /// Number of handles currently watched.
    pub fn socket_count(&self) -> usize {
        self.fleet.lock().unwrap().owner.len()
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.fleet.lock().unwrap().workers.len()
    }

    pub fn max_sockets(&self) -> usize {
        self.max_sockets
    }

    pub fn worker_size(&self) -> usize {
        self.worker_size
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Take the workers out before joining: a callback in flight may
        // call back into `remove`, which needs the fleet mutex.
        let workers: Vec<Worker> = {
            let mut fleet = self.fleet.lock().unwrap();
            fleet.by_load.clear();
            fleet.load_of.clear();
            fleet.owner.clear();
            fleet.workers.drain().map(|(_, worker)| worker).collect()
        };
        // Flag every worker down before joining any, so stragglers exit in
        // parallel; Worker::drop joins each in turn.
        for worker in &workers {
            worker.stop();
        }
        drop(workers);
    }
}

/// Shrink the requested worker size until `min_workers` workers fit in
/// `max_sockets`, rounding up on a remainder.
fn effective_worker_size(max_sockets: usize, requested: usize, min_workers: usize) -> usize {
    if max_sockets == 0 || requested == 0 {
        return 0;
    }
    let mut size = requested;
    if min_workers > 0 && min_workers > max_sockets / requested {
        size = max_sockets / min_workers;
        if max_sockets % min_workers != 0 {
            size += 1;
        }
    }
    size
}
