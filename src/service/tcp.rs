//! The TCP service: accept loop, peer lifecycle and byte forwarding.

use super::peer::Peer;
use super::session::Session;
use super::ServiceSettings;
use crate::balancer::Balancer;
use crate::error::{Error, Result};
use crate::node::{NodeDirectory, NodeId, ServiceId};
use crate::pool::BufferPool;
use crate::poller::{Interest, Poller, ReadyFn};
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Per-worker readiness set size handed to the poller.
const POLLER_WORKER_SIZE: usize = 64;
/// Minimum worker count handed to the poller.
const POLLER_MIN_WORKERS: usize = 4;
/// How long the readiness callback waits for a buffer before skipping the
/// round. The dropped read re-fires: polling is level-triggered.
const BUFFER_POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Timeout for the node-side connect made at accept time.
const NODE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer bookkeeping. `peers` is authoritative, one entry per live peer,
/// keyed by the client handle; `links` maps each peer's node-side handle
/// back to its client handle.
#[derive(Default)]
struct PeerTable {
    peers: HashMap<RawFd, Arc<Peer>>,
    links: HashMap<RawFd, RawFd>,
}

struct Core {
    id: ServiceId,
    settings: ServiceSettings,
    nodes: Arc<NodeDirectory>,
    balancer: Balancer,
    started: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<Poller>>,
    pool: Mutex<Option<Arc<BufferPool<u8>>>>,
    peers: Mutex<PeerTable>,
    sessions: DashMap<IpAddr, SessionEntry>,
}

struct SessionEntry {
    node: NodeId,
    session: Session,
}

/// A raw TCP front end: accepted byte streams are forwarded verbatim to
/// the node chosen at accept time, in both directions.
pub struct TcpService {
    core: Arc<Core>,
}

impl TcpService {
    pub(crate) fn new(
        id: ServiceId,
        settings: ServiceSettings,
        nodes: Arc<NodeDirectory>,
    ) -> Self {
        let balancer = Balancer::new(settings.algorithm);
        Self {
            core: Arc::new(Core {
                id,
                settings,
                nodes,
                balancer,
                started: AtomicBool::new(false),
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                accept_thread: Mutex::new(None),
                poller: Mutex::new(None),
                pool: Mutex::new(None),
                peers: Mutex::new(PeerTable::default()),
                sessions: DashMap::new(),
            }),
        }
    }

    /// Bind the listener, build the poller and buffer pool, spawn the
    /// accept thread. Bind and listen failures abort the start.
    pub fn start(&self) -> Result<()> {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidInput(format!(
                "service '{}' is already started",
                self.core.settings.name
            )));
        }
        if let Err(e) = self.core.bring_up() {
            self.core.tear_down();
            return Err(e);
        }
        Ok(())
    }

    /// Close the listener, join the accept thread, destroy every peer,
    /// then the poller (joining its workers) and the pool (joining its
    /// allocator). Idempotent.
    pub fn stop(&self) {
        if !self.core.started.load(Ordering::SeqCst)
            && self.core.accept_thread.lock().unwrap().is_none()
        {
            return;
        }
        info!(service = %self.core.settings.name, "stopping service");
        self.core.tear_down();
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.core.settings
    }

    pub fn id(&self) -> ServiceId {
        self.core.id
    }

    pub fn associate(&self, node: NodeId) {
        self.core.balancer.associate(node);
    }

    pub fn detach(&self, node: NodeId) {
        self.core.balancer.detach(node);
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.core.balancer.members()
    }

    pub fn peer_count(&self) -> usize {
        self.core.peers.lock().unwrap().peers.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.core.local_addr.lock().unwrap()
    }

    pub fn is_started(&self) -> bool {
        self.core.started.load(Ordering::SeqCst)
    }
}

impl Drop for TcpService {
    fn drop(&mut self) {
        self.core.tear_down();
    }
}

impl Core {
    fn bring_up(self: &Arc<Self>) -> Result<()> {
        let addr = SocketAddr::new(self.settings.host, self.settings.port);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        let local = listener.local_addr()?;

        let pool = Arc::new(BufferPool::new(self.settings.buffer)?);

        let weak: Weak<Core> = Arc::downgrade(self);
        let callback: Arc<ReadyFn> = Arc::new(move |read, write| {
            if let Some(core) = weak.upgrade() {
                core.on_ready(read, write);
            }
        });
        // Two descriptors per peer: client side and node side.
        let poller = Poller::new(
            callback,
            self.settings.max_connections * 2,
            POLLER_WORKER_SIZE,
            POLLER_MIN_WORKERS,
        )?;

        let accept_listener = listener.try_clone()?;
        *self.local_addr.lock().unwrap() = Some(local);
        *self.listener.lock().unwrap() = Some(listener);
        *self.poller.lock().unwrap() = Some(poller);
        *self.pool.lock().unwrap() = Some(pool);

        let core = Arc::clone(self);
        let handle = thread::spawn(move || core.accept_loop(accept_listener));
        *self.accept_thread.lock().unwrap() = Some(handle);

        info!(
            service = %self.settings.name,
            listen = %local,
            algorithm = ?self.settings.algorithm,
            max_connections = self.settings.max_connections,
            "service started"
        );
        Ok(())
    }

    fn tear_down(&self) {
        self.started.store(false, Ordering::SeqCst);

        // Shut the listen socket down to unblock accept; the accept thread
        // reads the cleared flag and exits.
        if let Some(listener) = self.listener.lock().unwrap().take() {
            unsafe {
                libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Destroy surviving peers before the poller goes away.
        let drained: Vec<Arc<Peer>> = {
            let mut table = self.peers.lock().unwrap();
            table.links.clear();
            table.peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in &drained {
            self.balancer.release(peer.node());
        }
        if !drained.is_empty() {
            debug!(service = %self.settings.name, peers = drained.len(), "destroyed peers");
        }
        drop(drained);

        let poller = self.poller.lock().unwrap().take();
        drop(poller);
        let pool = self.pool.lock().unwrap().take();
        drop(pool);

        self.sessions.clear();
        *self.local_addr.lock().unwrap() = None;
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!(service = %self.settings.name, "accept loop running");
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    // A refused peer's handle is closed on drop right here:
                    // this is how "at capacity" and "no nodes" surface.
                    if self.create_peer(stream, addr).is_none() {
                        trace!(client = %addr, "connection refused");
                    }
                }
                Err(e) => {
                    if !self.started.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(service = %self.settings.name, error = %e, "accept failed");
                }
            }
        }
        debug!(service = %self.settings.name, "accept loop exited");
    }

    fn create_peer(&self, stream: TcpStream, addr: SocketAddr) -> Option<Arc<Peer>> {
        {
            let table = self.peers.lock().unwrap();
            if table.peers.len() >= self.settings.max_connections {
                debug!(service = %self.settings.name, client = %addr, "at capacity, refusing");
                return None;
            }
        }

        let node = self.select_node(addr.ip())?;
        let Some(node_addr) = self.nodes.addr(node) else {
            warn!(service = %self.settings.name, %node, "selected node is gone");
            self.balancer.release(node);
            return None;
        };

        let node_stream = match TcpStream::connect_timeout(&node_addr, NODE_CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    service = %self.settings.name,
                    node = %node_addr,
                    error = %e,
                    "failed to connect to node"
                );
                self.balancer.release(node);
                return None;
            }
        };

        let peer = Arc::new(Peer::new(stream, node_stream, node, addr));
        let (client_fd, node_fd) = (peer.client_fd(), peer.node_fd());
        {
            let mut table = self.peers.lock().unwrap();
            table.peers.insert(client_fd, Arc::clone(&peer));
            table.links.insert(node_fd, client_fd);
        }

        let registered = {
            let guard = self.poller.lock().unwrap();
            match guard.as_ref() {
                Some(poller) => poller
                    .add(client_fd, Interest::READ)
                    .and_then(|()| poller.add(node_fd, Interest::READ)),
                None => Err(Error::InvalidInput("service is not running".to_string())),
            }
        };
        if let Err(e) = registered {
            warn!(service = %self.settings.name, error = %e, "failed to watch peer");
            let mut table = self.peers.lock().unwrap();
            table.peers.remove(&client_fd);
            table.links.remove(&node_fd);
            drop(table);
            if let Some(poller) = self.poller.lock().unwrap().as_ref() {
                poller.remove(client_fd);
                poller.remove(node_fd);
            }
            self.balancer.release(node);
            return None;
        }

        info!(
            service = %self.settings.name,
            client = %addr,
            %node,
            node_addr = %node_addr,
            "peer connected"
        );
        Some(peer)
    }

    /// Session-aware node selection: a still-valid session re-pins its
    /// node and restarts its timer, anything else falls back to the
    /// balancer (recording a fresh session when sessions are enabled).
    fn select_node(&self, client: IpAddr) -> Option<NodeId> {
        let timeout = self.settings.session_timeout;
        if !timeout.is_zero() {
            let resumed = self.sessions.get(&client).and_then(|entry| {
                (entry.session.is_valid() && self.balancer.pin(entry.node)).then(|| {
                    entry.session.reset();
                    entry.node
                })
            });
            if let Some(node) = resumed {
                debug!(%client, %node, "session resumed");
                return Some(node);
            }
            self.sessions.remove(&client);
        }

        let Some(node) = self.balancer.select() else {
            warn!(service = %self.settings.name, "no nodes associated, refusing connection");
            return None;
        };
        if !timeout.is_zero() {
            self.sessions
                .insert(client, SessionEntry { node, session: Session::new(timeout) });
        }
        Some(node)
    }

    /// Readiness callback, invoked on poller worker threads.
    fn on_ready(&self, read: &[RawFd], _write: &[RawFd]) {
        let pool = self.pool.lock().unwrap().clone();
        let Some(pool) = pool else {
            return; // stopping
        };

        for &handle in read {
            // Racy teardown: the handle may already be gone.
            let Some((peer, from_client)) = self.lookup(handle) else {
                continue;
            };

            let Some(mut buf) = pool.poll(Some(BUFFER_POLL_TIMEOUT)) else {
                debug!(handle, "buffer pool exhausted, skipping readiness round");
                continue;
            };

            let (src, dst) = if from_client {
                (peer.client_stream(), peer.node_side())
            } else {
                (peer.node_side(), peer.client_stream())
            };

            let mut src_ref: &TcpStream = src;
            match src_ref.read(&mut buf) {
                Ok(0) => {
                    debug!(client = %peer.addr(), from_client, "peer closed");
                    self.destroy_peer(peer.client_fd());
                }
                Ok(n) => {
                    let mut dst_ref: &TcpStream = dst;
                    match dst_ref.write_all(&buf[..n]) {
                        Ok(()) => {
                            trace!(bytes = n, from_client, client = %peer.addr(), "forwarded")
                        }
                        Err(e) => {
                            debug!(client = %peer.addr(), error = %e, "forward failed");
                            self.destroy_peer(peer.client_fd());
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(client = %peer.addr(), error = %e, "recv failed");
                    self.destroy_peer(peer.client_fd());
                }
            }
            // buf drops here, returning the allocation to the pool
        }
    }

    fn lookup(&self, handle: RawFd) -> Option<(Arc<Peer>, bool)> {
        let table = self.peers.lock().unwrap();
        if let Some(peer) = table.peers.get(&handle) {
            return Some((Arc::clone(peer), true));
        }
        let client_fd = table.links.get(&handle)?;
        table.peers.get(client_fd).map(|peer| (Arc::clone(peer), false))
    }

    /// Remove the peer from the table and the poller, free its node
    /// connection credit, and close both sockets.
    fn destroy_peer(&self, client_fd: RawFd) {
        let peer = {
            let mut table = self.peers.lock().unwrap();
            let Some(peer) = table.peers.remove(&client_fd) else {
                return;
            };
            table.links.remove(&peer.node_fd());
            peer
        };

        if let Some(poller) = self.poller.lock().unwrap().as_ref() {
            poller.remove(client_fd);
            poller.remove(peer.node_fd());
        }
        self.balancer.release(peer.node());

        debug!(
            service = %self.settings.name,
            client = %peer.addr(),
            node = %peer.node(),
            "peer destroyed"
        );
    }
}
