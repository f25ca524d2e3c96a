//! Back-end nodes and the handle types that index the topology.
//!
//! A [`Node`] is an immutable record of one back-end endpoint. Services,
//! balancers and peers refer to nodes by [`NodeId`] handle; the binding of
//! a node to its service lives in the server's registry, not on the node.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;

/// Stable integer handle of a node within a [`crate::server::Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

/// Stable integer handle of a service within a [`crate::server::Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service#{}", self.0)
    }
}

/// Transport-layer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

/// Application-layer protocol riding on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Application {
    None,
    Http,
    Https,
}

/// The `(host, port, transport, application)` tuple that uniquely
/// identifies a listener or a back-end endpoint at the server level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: IpAddr,
    pub port: u16,
    pub transport: Transport,
    pub application: Application,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({:?}/{:?})", self.host, self.port, self.transport, self.application)
    }
}

/// One back-end endpoint. Immutable after creation.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    transport: Transport,
    application: Application,
    host: IpAddr,
    port: u16,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        transport: Transport,
        application: Application,
        host: IpAddr,
        port: u16,
    ) -> Self {
        Self { id, name, transport, application, host, port }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn application(&self) -> Application {
        self.application
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The socket address peers are forwarded to.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host,
            port: self.port,
            transport: self.transport,
            application: self.application,
        }
    }
}

/// The server's flat node table: primary storage plus name and endpoint
/// indexes and the node→service bindings, all kept consistent under one
/// lock. Shared with services, which resolve node addresses through it.
pub struct NodeDirectory {
    inner: RwLock<Table>,
}

#[derive(Default)]
struct Table {
    by_id: HashMap<NodeId, Node>,
    by_name: HashMap<String, NodeId>,
    by_endpoint: HashMap<Endpoint, NodeId>,
    bindings: HashMap<NodeId, ServiceId>,
    next_id: u32,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Table::default()) }
    }

    /// Register a node. Fails (returns `None`, mutating nothing) on a
    /// duplicate name or endpoint tuple.
    pub(crate) fn insert(
        &self,
        name: String,
        transport: Transport,
        application: Application,
        host: IpAddr,
        port: u16,
    ) -> Option<NodeId> {
        let mut table = self.inner.write().unwrap();
        let endpoint = Endpoint { host, port, transport, application };
        if table.by_name.contains_key(&name) || table.by_endpoint.contains_key(&endpoint) {
            return None;
        }

        let id = NodeId(table.next_id);
        table.next_id += 1;
        let node = Node::new(id, name.clone(), transport, application, host, port);
        table.by_id.insert(id, node);
        table.by_name.insert(name, id);
        table.by_endpoint.insert(endpoint, id);
        Some(id)
    }

    pub(crate) fn remove(&self, id: NodeId) -> Option<Node> {
        let mut table = self.inner.write().unwrap();
        let node = table.by_id.remove(&id)?;
        table.by_name.remove(node.name());
        table.by_endpoint.remove(&node.endpoint());
        table.bindings.remove(&id);
        Some(node)
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.inner.read().unwrap().by_id.get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.inner.read().unwrap().by_name.get(name).copied()
    }

    pub fn find_by_endpoint(&self, endpoint: &Endpoint) -> Option<NodeId> {
        self.inner.read().unwrap().by_endpoint.get(endpoint).copied()
    }

    /// Forwarding address of a node.
    pub fn addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.inner.read().unwrap().by_id.get(&id).map(Node::addr)
    }

    pub(crate) fn bind(&self, id: NodeId, service: ServiceId) {
        self.inner.write().unwrap().bindings.insert(id, service);
    }

    pub fn service_of(&self, id: NodeId) -> Option<ServiceId> {
        self.inner.read().unwrap().bindings.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.inner.read().unwrap().by_id.keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn contains_name(&self, name: &str) -> bool {
        self.inner.read().unwrap().by_name.contains_key(name)
    }
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_endpoint() {
        let node = Node::new(
            NodeId(7),
            "web-1".to_string(),
            Transport::Tcp,
            Application::None,
            "127.0.0.1".parse().unwrap(),
            9100,
        );
        assert_eq!(node.addr(), "127.0.0.1:9100".parse().unwrap());
        assert_eq!(node.endpoint().port, 9100);
        assert_eq!(node.id(), NodeId(7));
    }

    #[test]
    fn test_directory_rejects_duplicates() {
        let directory = NodeDirectory::new();
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let id = directory
            .insert("web-1".into(), Transport::Tcp, Application::None, host, 80)
            .unwrap();

        // Duplicate name.
        assert!(directory
            .insert("web-1".into(), Transport::Tcp, Application::None, host, 81)
            .is_none());
        // Duplicate endpoint tuple.
        assert!(directory
            .insert("web-2".into(), Transport::Tcp, Application::None, host, 80)
            .is_none());
        assert_eq!(directory.len(), 1);

        assert_eq!(directory.find_by_name("web-1"), Some(id));
        assert_eq!(directory.addr(id), Some("10.0.0.1:80".parse().unwrap()));
    }

    #[test]
    fn test_directory_remove_clears_indexes() {
        let directory = NodeDirectory::new();
        let host: IpAddr = "10.0.0.1".parse().unwrap();
        let id = directory
            .insert("web-1".into(), Transport::Tcp, Application::None, host, 80)
            .unwrap();
        directory.bind(id, ServiceId(0));

        let node = directory.remove(id).unwrap();
        assert_eq!(node.name(), "web-1");
        assert!(directory.find_by_name("web-1").is_none());
        assert!(directory.find_by_endpoint(&node.endpoint()).is_none());
        assert!(directory.service_of(id).is_none());

        // The same name and endpoint are free again.
        assert!(directory
            .insert("web-1".into(), Transport::Tcp, Application::None, host, 80)
            .is_some());
    }

    #[test]
    fn test_endpoint_uniqueness_key() {
        use std::collections::HashSet;

        let a = Endpoint {
            host: "10.0.0.1".parse().unwrap(),
            port: 80,
            transport: Transport::Tcp,
            application: Application::None,
        };
        let b = Endpoint { application: Application::Http, ..a };

        let mut set = HashSet::new();
        assert!(set.insert(a));
        // Same host:port under a different application protocol is distinct.
        assert!(set.insert(b));
        assert!(!set.insert(a));
    }
}
