//! Front-end services: the listen/accept/forward machinery.
//!
//! A [`Service`] joins a listen socket, a balancer, a peer table, a buffer
//! pool and a poller. The set of transport protocols is closed; only TCP
//! is runnable, and the dispatch enum is where further protocols would
//! plug in.

mod peer;
mod session;
mod tcp;

pub use peer::Peer;
pub use session::Session;
pub use tcp::TcpService;

use crate::balancer::Algorithm;
use crate::error::Result;
use crate::node::{Application, Endpoint, NodeId, Transport};
use crate::pool::PoolSettings;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Per-service configuration, resolved from the config file or supplied
/// programmatically.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Unique name within the server.
    pub name: String,
    /// Address to bind.
    pub host: IpAddr,
    /// Port to bind. Port 0 binds an ephemeral port.
    pub port: u16,
    /// Node-selection policy.
    pub algorithm: Algorithm,
    /// Sticky-session lifetime; zero disables sessions.
    pub session_timeout: Duration,
    /// Maximum concurrent peers; further accepts are refused.
    pub max_connections: usize,
    /// Buffer pool sizing for the readiness path.
    pub buffer: PoolSettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            algorithm: Algorithm::RoundRobin,
            session_timeout: Duration::ZERO,
            max_connections: 256,
            buffer: {
                let mut buffer = PoolSettings::new(8192, 512, 2048, 128);
                buffer.batch = 32;
                buffer
            },
        }
    }
}

/// A front-end listener, dispatching over the (closed) protocol set.
pub enum Service {
    Tcp(TcpService),
}

impl Service {
    /// Allocate OS resources and spawn the accept thread.
    pub fn start(&self) -> Result<()> {
        match self {
            Service::Tcp(service) => service.start(),
        }
    }

    /// Reverse `start`: close the listener, destroy every peer, join every
    /// thread. Idempotent.
    pub fn stop(&self) {
        match self {
            Service::Tcp(service) => service.stop(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Service::Tcp(service) => &service.settings().name,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Service::Tcp(_) => Transport::Tcp,
        }
    }

    pub fn application(&self) -> Application {
        match self {
            Service::Tcp(_) => Application::None,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        match self {
            Service::Tcp(service) => service.settings(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        let settings = self.settings();
        Endpoint {
            host: settings.host,
            port: settings.port,
            transport: self.transport(),
            application: self.application(),
        }
    }

    /// Add a node to this service's balancer. Duplicates are ignored.
    pub fn associate(&self, node: NodeId) {
        match self {
            Service::Tcp(service) => service.associate(node),
        }
    }

    /// Remove a node from this service's balancer. Absent nodes are
    /// ignored.
    pub fn detach(&self, node: NodeId) {
        match self {
            Service::Tcp(service) => service.detach(node),
        }
    }

    /// Nodes currently associated with this service.
    pub fn nodes(&self) -> Vec<NodeId> {
        match self {
            Service::Tcp(service) => service.nodes(),
        }
    }

    /// Live accepted peers.
    pub fn peer_count(&self) -> usize {
        match self {
            Service::Tcp(service) => service.peer_count(),
        }
    }

    /// The actually bound address once started (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Service::Tcp(service) => service.local_addr(),
        }
    }

    pub fn is_started(&self) -> bool {
        match self {
            Service::Tcp(service) => service.is_started(),
        }
    }
}
