//! The topology registry and process-lifecycle controller.
//!
//! A [`Server`] owns flat tables of services and nodes, indexed by stable
//! integer handles plus name and endpoint views. Config ingestion fills
//! the tables; `run` starts every service; `finish` blocks until `stop`
//! and then tears the whole topology down.

use crate::balancer::Algorithm;
use crate::config::{resolve_config, Config, NodeSpec, ServerSection, ServiceSection};
use crate::error::{Error, Result};
use crate::node::{Application, Endpoint, Node, NodeDirectory, NodeId, ServiceId, Transport};
use crate::service::{Service, ServiceSettings, TcpService};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use tracing::{info, warn};

/// Service registry: primary table plus name and endpoint indexes, all
/// mutated under one lock.
#[derive(Default)]
struct ServiceRegistry {
    by_id: HashMap<ServiceId, Arc<Service>>,
    by_name: HashMap<String, ServiceId>,
    by_endpoint: HashMap<Endpoint, ServiceId>,
    next_id: u32,
}

/// Latch released by `stop` and awaited by `finish`.
#[derive(Default)]
struct StopGate {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopGate {
    fn open(&self) {
        *self.stopped.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            stopped = self.cond.wait(stopped).unwrap();
        }
    }
}

struct Inner {
    /// Raw `server:` section retained for snapshots.
    section: Mutex<ServerSection>,
    /// Template applied to config services that omit optional fields.
    template: Mutex<ServiceSettings>,
    services: Mutex<ServiceRegistry>,
    nodes: Arc<NodeDirectory>,
    stop: StopGate,
}

/// Topology registry and lifecycle controller. Cheap to clone; clones
/// share the same registries.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                section: Mutex::new(ServerSection::default()),
                template: Mutex::new(ServiceSettings::default()),
                services: Mutex::new(ServiceRegistry::default()),
                nodes: Arc::new(NodeDirectory::new()),
                stop: StopGate::default(),
            }),
        }
    }

    /// Register everything a config describes, without starting anything.
    pub fn load(&self, config: &Config) -> Result<()> {
        self.ingest(config)
    }

    /// Ingest a configuration and start every registered service.
    pub fn run(&self, config: Config) -> Result<()> {
        self.ingest(&config)?;

        let services: Vec<Arc<Service>> = {
            let registry = self.inner.services.lock().unwrap();
            registry.by_id.values().cloned().collect()
        };
        for service in &services {
            if service.is_started() {
                continue;
            }
            if let Err(e) = service.start() {
                warn!(service = service.name(), error = %e, "startup failed, stopping");
                for started in &services {
                    started.stop();
                }
                return Err(e);
            }
        }

        info!(services = services.len(), nodes = self.node_count(), "server running");
        Ok(())
    }

    /// Release the stop gate. `finish` does the actual teardown.
    pub fn stop(&self) {
        self.inner.stop.open();
    }

    /// Block until `stop` is called, then stop every service, joining all
    /// of their threads before returning.
    pub fn finish(&self) {
        self.inner.stop.wait();

        let services: Vec<Arc<Service>> = {
            let registry = self.inner.services.lock().unwrap();
            registry.by_id.values().cloned().collect()
        };
        for service in &services {
            service.stop();
        }
        info!("server stopped");
    }

    /// Register a service. The name is auto-generated when empty. Fails
    /// without mutating any index on an unsupported protocol, a duplicate
    /// name, or a duplicate endpoint tuple.
    pub fn add_service(
        &self,
        transport: Transport,
        application: Application,
        mut settings: ServiceSettings,
    ) -> Result<ServiceId> {
        if (transport, application) != (Transport::Tcp, Application::None) {
            return Err(Error::InvalidInput(format!(
                "unsupported protocol {:?}/{:?}",
                transport, application
            )));
        }

        let mut registry = self.inner.services.lock().unwrap();

        if settings.name.is_empty() {
            settings.name = next_free_name("Service", registry.by_name.len(), |name| {
                registry.by_name.contains_key(name)
            });
        }
        if registry.by_name.contains_key(&settings.name) {
            return Err(Error::Validation(format!(
                "duplicate service name '{}'",
                settings.name
            )));
        }
        let endpoint = Endpoint { host: settings.host, port: settings.port, transport, application };
        if registry.by_endpoint.contains_key(&endpoint) {
            return Err(Error::Validation(format!(
                "duplicate service endpoint {endpoint}"
            )));
        }

        let id = ServiceId(registry.next_id);
        registry.next_id += 1;
        let service = Arc::new(Service::Tcp(TcpService::new(
            id,
            settings.clone(),
            Arc::clone(&self.inner.nodes),
        )));
        registry.by_id.insert(id, Arc::clone(&service));
        registry.by_name.insert(settings.name.clone(), id);
        registry.by_endpoint.insert(endpoint, id);

        info!(service = %settings.name, id = %id, "service registered");
        Ok(id)
    }

    /// Unregister a service, removing every node that was associated with
    /// it. Returns false for an unknown id.
    pub fn remove_service(&self, id: ServiceId) -> bool {
        let Some(service) = self.service(id) else {
            return false;
        };

        for node in service.nodes() {
            self.remove_node(node);
        }
        service.stop();

        let mut registry = self.inner.services.lock().unwrap();
        if registry.by_id.remove(&id).is_some() {
            registry.by_name.remove(service.name());
            registry.by_endpoint.remove(&service.endpoint());
        }
        true
    }

    /// Register a node and associate it with a service's balancer. The
    /// name is auto-generated when absent. Fails without mutation on a
    /// duplicate name or endpoint tuple.
    pub fn add_node(&self, service: ServiceId, spec: NodeSpec) -> Result<NodeId> {
        let Some(target) = self.service(service) else {
            return Err(Error::InvalidInput(format!("unknown service {service}")));
        };

        let name = match spec.name {
            Some(name) => name,
            None => next_free_name("Node", self.inner.nodes.len(), |name| {
                self.inner.nodes.contains_name(name)
            }),
        };
        let endpoint = Endpoint {
            host: spec.host,
            port: spec.port,
            transport: spec.transport,
            application: spec.application,
        };
        if self.inner.nodes.contains_name(&name) {
            return Err(Error::Validation(format!("duplicate node name '{name}'")));
        }
        if self.inner.nodes.find_by_endpoint(&endpoint).is_some() {
            return Err(Error::Validation(format!("duplicate node endpoint {endpoint}")));
        }

        let Some(id) = self.inner.nodes.insert(
            name.clone(),
            spec.transport,
            spec.application,
            spec.host,
            spec.port,
        ) else {
            return Err(Error::Validation(format!("duplicate node '{name}'")));
        };
        self.inner.nodes.bind(id, service);
        target.associate(id);

        info!(node = %name, %id, service = target.name(), "node registered");
        Ok(id)
    }

    /// Detach a node from its service and delete it. Returns false for an
    /// unknown id.
    pub fn remove_node(&self, id: NodeId) -> bool {
        if let Some(service_id) = self.inner.nodes.service_of(id) {
            if let Some(service) = self.service(service_id) {
                service.detach(id);
            }
        }
        self.inner.nodes.remove(id).is_some()
    }

    pub fn service(&self, id: ServiceId) -> Option<Arc<Service>> {
        self.inner.services.lock().unwrap().by_id.get(&id).cloned()
    }

    pub fn service_by_name(&self, name: &str) -> Option<Arc<Service>> {
        let registry = self.inner.services.lock().unwrap();
        let id = registry.by_name.get(name)?;
        registry.by_id.get(id).cloned()
    }

    pub fn service_by_endpoint(&self, endpoint: &Endpoint) -> Option<Arc<Service>> {
        let registry = self.inner.services.lock().unwrap();
        let id = registry.by_endpoint.get(endpoint)?;
        registry.by_id.get(id).cloned()
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        let registry = self.inner.services.lock().unwrap();
        let mut ids: Vec<_> = registry.by_id.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn service_count(&self) -> usize {
        self.inner.services.lock().unwrap().by_id.len()
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.inner.nodes.get(id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<Node> {
        let id = self.inner.nodes.find_by_name(name)?;
        self.inner.nodes.get(id)
    }

    pub fn node_by_endpoint(&self, endpoint: &Endpoint) -> Option<Node> {
        let id = self.inner.nodes.find_by_endpoint(endpoint)?;
        self.inner.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// The raw `server:` section currently in effect.
    pub fn section(&self) -> ServerSection {
        self.inner.section.lock().unwrap().clone()
    }

    /// Serialize the in-memory topology back into the config schema.
    pub fn snapshot(&self) -> Config {
        let mut services = Vec::new();
        for id in self.service_ids() {
            let Some(service) = self.service(id) else {
                continue;
            };
            let settings = service.settings();

            let mut node_ids = service.nodes();
            node_ids.sort();
            let nodes: Vec<_> = node_ids
                .into_iter()
                .filter_map(|node_id| self.node(node_id))
                .map(|node| crate::config::NodeSection {
                    name: Some(node.name().to_string()),
                    protocol: protocol_token(node.transport(), node.application())
                        .map(str::to_string),
                    host: Some(node.host().to_string()),
                    port: Some(node.port()),
                })
                .collect();

            services.push(ServiceSection {
                name: Some(settings.name.clone()),
                protocol: protocol_token(service.transport(), service.application())
                    .map(str::to_string),
                host: Some(settings.host.to_string()),
                port: Some(settings.port),
                balancing: Some(algorithm_token(settings.algorithm).to_string()),
                session: if settings.session_timeout.is_zero() {
                    None
                } else {
                    Some(format!("{}s", settings.session_timeout.as_secs()))
                },
                max_connections: Some(settings.max_connections as u32),
                monitor: None,
                nodes: crate::config::OneOrMany::Many(nodes),
            });
        }

        Config {
            server: self.section(),
            services: crate::config::OneOrMany::Many(services),
        }
    }

    /// Write the current topology as YAML.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.snapshot())?;
        std::fs::write(path.as_ref(), yaml)?;
        Ok(())
    }

    fn ingest(&self, config: &Config) -> Result<()> {
        let specs = resolve_config(config)?;

        *self.inner.section.lock().unwrap() = config.server.clone();
        {
            let mut template = self.inner.template.lock().unwrap();
            if let Some(buffer) = &config.server.buffer {
                if let Some(size) = buffer.size {
                    template.buffer.size = size;
                }
                if let Some(preallocation) = buffer.preallocation {
                    template.buffer.preallocation = preallocation;
                }
                if let Some(max) = buffer.max {
                    template.buffer.max = max;
                }
                if let Some(reserve) = buffer.reserve {
                    template.buffer.reserve = reserve;
                }
                if let Some(batch) = buffer.batch {
                    template.buffer.batch = batch;
                }
            }
        }

        for (index, spec) in specs.into_iter().enumerate() {
            let mut settings = self.inner.template.lock().unwrap().clone();
            settings.name = spec.name.unwrap_or_default();
            settings.host = spec.host;
            settings.port = spec.port;
            settings.algorithm = spec.algorithm;
            settings.session_timeout = spec.session_timeout;
            if let Some(max_connections) = spec.max_connections {
                settings.max_connections = max_connections;
            }

            let service_id = self
                .add_service(spec.transport, spec.application, settings)
                .map_err(|e| Error::Validation(format!("service {index}: {e}")))?;

            for (node_index, node) in spec.nodes.into_iter().enumerate() {
                self.add_node(service_id, node).map_err(|e| {
                    Error::Validation(format!("service {index} node {node_index}: {e}"))
                })?;
            }
        }
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// `Service N` / `Node N` with a `#k` suffix retry until free.
fn next_free_name(prefix: &str, count: usize, taken: impl Fn(&str) -> bool) -> String {
    let name = format!("{prefix} {count}");
    if !taken(&name) {
        return name;
    }
    let mut attempt = 2;
    loop {
        let candidate = format!("{name}#{attempt}");
        if !taken(&candidate) {
            return candidate;
        }
        attempt += 1;
    }
}

fn protocol_token(transport: Transport, application: Application) -> Option<&'static str> {
    match (transport, application) {
        (Transport::Tcp, Application::None) => Some("tcp"),
        (Transport::Udp, Application::None) => Some("udp"),
        (Transport::Tcp, Application::Http) => Some("http"),
        (Transport::Tcp, Application::Https) => Some("https"),
        _ => None,
    }
}

fn algorithm_token(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::RoundRobin => "roundrobin",
        Algorithm::ConnectionCount => "connectioncount",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn tcp_settings(name: &str, port: u16) -> ServiceSettings {
        ServiceSettings {
            name: name.to_string(),
            host: "127.0.0.1".parse().unwrap(),
            port,
            ..Default::default()
        }
    }

    fn node_spec(name: Option<&str>, port: u16) -> NodeSpec {
        NodeSpec {
            name: name.map(str::to_string),
            transport: Transport::Tcp,
            application: Application::None,
            host: "127.0.0.1".parse::<IpAddr>().unwrap(),
            port,
        }
    }

    #[test]
    fn test_duplicate_service_name_rejected() {
        let server = Server::new();
        server
            .add_service(Transport::Tcp, Application::None, tcp_settings("web", 9000))
            .unwrap();
        let err = server
            .add_service(Transport::Tcp, Application::None, tcp_settings("web", 9001))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate service name"));
        assert_eq!(server.service_count(), 1);
    }

    #[test]
    fn test_duplicate_service_endpoint_rejected() {
        let server = Server::new();
        server
            .add_service(Transport::Tcp, Application::None, tcp_settings("a", 9000))
            .unwrap();
        let err = server
            .add_service(Transport::Tcp, Application::None, tcp_settings("b", 9000))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate service endpoint"));
    }

    #[test]
    fn test_unsupported_protocol_rejected() {
        let server = Server::new();
        let err = server
            .add_service(Transport::Udp, Application::None, tcp_settings("u", 9000))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(server.service_count(), 0);
    }

    #[test]
    fn test_auto_generated_names() {
        let server = Server::new();
        let a = server
            .add_service(Transport::Tcp, Application::None, tcp_settings("", 9000))
            .unwrap();
        assert_eq!(server.service(a).unwrap().name(), "Service 0");

        // A colliding explicit name forces the #k retry.
        server
            .add_service(Transport::Tcp, Application::None, tcp_settings("Service 2", 9001))
            .unwrap();
        let c = server
            .add_service(Transport::Tcp, Application::None, tcp_settings("", 9002))
            .unwrap();
        assert_eq!(server.service(c).unwrap().name(), "Service 2#2");
    }

    #[test]
    fn test_node_registration_and_lookup() {
        let server = Server::new();
        let service = server
            .add_service(Transport::Tcp, Application::None, tcp_settings("web", 9000))
            .unwrap();

        let node = server.add_node(service, node_spec(Some("web-1"), 9100)).unwrap();
        assert_eq!(server.node_count(), 1);
        assert_eq!(server.service(service).unwrap().nodes(), vec![node]);
        assert_eq!(server.node_by_name("web-1").unwrap().id(), node);

        let endpoint = Endpoint {
            host: "127.0.0.1".parse().unwrap(),
            port: 9100,
            transport: Transport::Tcp,
            application: Application::None,
        };
        assert_eq!(server.node_by_endpoint(&endpoint).unwrap().id(), node);

        // Duplicates of either key are rejected.
        assert!(server.add_node(service, node_spec(Some("web-1"), 9101)).is_err());
        assert!(server.add_node(service, node_spec(Some("web-2"), 9100)).is_err());
        assert_eq!(server.node_count(), 1);

        // Auto-named node.
        server.add_node(service, node_spec(None, 9102)).unwrap();
        assert!(server.node_by_name("Node 1").is_some());
    }

    #[test]
    fn test_remove_node_detaches_from_service() {
        let server = Server::new();
        let service = server
            .add_service(Transport::Tcp, Application::None, tcp_settings("web", 9000))
            .unwrap();
        let node = server.add_node(service, node_spec(Some("web-1"), 9100)).unwrap();

        assert!(server.remove_node(node));
        assert_eq!(server.node_count(), 0);
        assert!(server.service(service).unwrap().nodes().is_empty());
        assert!(!server.remove_node(node));
    }

    #[test]
    fn test_remove_service_cascades_to_nodes() {
        let server = Server::new();
        let service = server
            .add_service(Transport::Tcp, Application::None, tcp_settings("web", 9000))
            .unwrap();
        server.add_node(service, node_spec(Some("web-1"), 9100)).unwrap();
        server.add_node(service, node_spec(Some("web-2"), 9101)).unwrap();

        assert!(server.remove_service(service));
        assert_eq!(server.service_count(), 0);
        assert_eq!(server.node_count(), 0);
        assert!(!server.remove_service(service));
    }

    #[test]
    fn test_registry_views_agree() {
        let server = Server::new();
        for port in [9000, 9001, 9002] {
            server
                .add_service(
                    Transport::Tcp,
                    Application::None,
                    tcp_settings(&format!("svc-{port}"), port),
                )
                .unwrap();
        }
        let registry = server.inner.services.lock().unwrap();
        assert_eq!(registry.by_id.len(), 3);
        assert_eq!(registry.by_name.len(), 3);
        assert_eq!(registry.by_endpoint.len(), 3);
        for (name, id) in &registry.by_name {
            assert_eq!(registry.by_id[id].name(), name);
        }
    }

    #[test]
    fn test_ingest_from_config() {
        let yaml = r#"
server:
  max_connections: 2048
services:
  - name: front
    protocol: tcp
    host: 127.0.0.1
    port: 9000
    balancing: cc
    session: 30s
    max_connections: 32
    nodes:
      - protocol: tcp
        host: 127.0.0.1
        port: 9100
      - protocol: tcp
        host: 127.0.0.1
        port: 9101
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let server = Server::new();
        server.ingest(&config).unwrap();

        assert_eq!(server.section().max_connections, 2048);
        let service = server.service_by_name("front").unwrap();
        assert_eq!(service.settings().max_connections, 32);
        assert_eq!(service.settings().algorithm, Algorithm::ConnectionCount);
        assert_eq!(service.nodes().len(), 2);
        assert!(server.node_by_name("Node 0").is_some());
    }

    #[test]
    fn test_ingest_duplicate_reports_index() {
        let yaml = r#"
services:
  - protocol: tcp
    host: 127.0.0.1
    port: 9000
  - protocol: tcp
    host: 127.0.0.1
    port: 9000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let server = Server::new();
        let err = server.ingest(&config).unwrap_err();
        assert!(err.to_string().contains("service 1"));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let yaml = r#"
services:
  - protocol: tcp
    host: 127.0.0.1
    port: 9000
    session: 45s
    nodes:
      - protocol: tcp
        host: 127.0.0.1
        port: 9100
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let first = Server::new();
        first.ingest(&config).unwrap();

        let serialized = serde_yaml::to_string(&first.snapshot()).unwrap();
        let reloaded: Config = serde_yaml::from_str(&serialized).unwrap();
        let second = Server::new();
        second.ingest(&reloaded).unwrap();

        assert_eq!(first.service_count(), second.service_count());
        assert_eq!(first.node_count(), second.node_count());
        let a = first.service_by_name("Service 0").unwrap();
        let b = second.service_by_name("Service 0").unwrap();
        assert_eq!(a.settings().session_timeout, b.settings().session_timeout);
        assert_eq!(a.endpoint(), b.endpoint());
        assert_eq!(
            first.node_by_name("Node 0").unwrap().addr(),
            second.node_by_name("Node 0").unwrap().addr()
        );
    }

    #[test]
    fn test_stop_gate() {
        let server = Server::new();
        let waiter = server.clone();
        let handle = std::thread::spawn(move || waiter.finish());
        std::thread::sleep(std::time::Duration::from_millis(30));
        server.stop();
        handle.join().unwrap();
    }
}
