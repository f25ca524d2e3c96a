//! Semantic validation: raw config sections into typed specs.
//!
//! Every error names the offending service (and node) by index, since
//! config entries may have no name of their own yet.

use crate::balancer::Algorithm;
use crate::config::types::{Config, NodeSection, ServiceSection};
use crate::error::{Error, Result};
use crate::node::{Application, Transport};
use std::net::IpAddr;
use std::time::Duration;

/// A validated service entry, ready for registration.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: Option<String>,
    pub transport: Transport,
    pub application: Application,
    pub host: IpAddr,
    pub port: u16,
    pub algorithm: Algorithm,
    pub session_timeout: Duration,
    pub max_connections: Option<usize>,
    pub nodes: Vec<NodeSpec>,
}

/// A validated node entry.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: Option<String>,
    pub transport: Transport,
    pub application: Application,
    pub host: IpAddr,
    pub port: u16,
}

/// Validate every service and node entry of a parsed config.
pub fn resolve_config(config: &Config) -> Result<Vec<ServiceSpec>> {
    config
        .services
        .iter()
        .enumerate()
        .map(|(index, service)| resolve_service(service, index))
        .collect()
}

fn resolve_service(service: &ServiceSection, index: usize) -> Result<ServiceSpec> {
    let protocol = service
        .protocol
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("service {index}: protocol is missing")))?;
    let (transport, application) = parse_protocols(protocol).ok_or_else(|| {
        Error::Validation(format!("service {index}: invalid protocol '{protocol}'"))
    })?;

    let host = service
        .host
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("service {index}: host is missing")))?;
    let host: IpAddr = host.parse().map_err(|_| {
        Error::Validation(format!("service {index}: invalid host address '{host}'"))
    })?;

    let port = match service.port {
        Some(port) if port != 0 => port,
        _ => {
            return Err(Error::Validation(format!(
                "service {index}: port is missing or 0"
            )))
        }
    };

    let balancing = service.balancing.as_deref().unwrap_or("");
    let algorithm = parse_balancing(balancing).ok_or_else(|| {
        Error::Validation(format!(
            "service {index}: invalid balancing algorithm '{balancing}'"
        ))
    })?;

    let session = service.session.as_deref().unwrap_or("");
    let session_timeout = parse_session(session).ok_or_else(|| {
        Error::Validation(format!("service {index}: invalid session '{session}'"))
    })?;

    let nodes = service
        .nodes
        .iter()
        .enumerate()
        .map(|(node_index, node)| resolve_node(node, node_index, index))
        .collect::<Result<Vec<_>>>()?;

    Ok(ServiceSpec {
        name: service.name.clone().filter(|name| !name.is_empty()),
        transport,
        application,
        host,
        port,
        algorithm,
        session_timeout,
        max_connections: service.max_connections.map(|n| n as usize),
        nodes,
    })
}

fn resolve_node(node: &NodeSection, index: usize, service_index: usize) -> Result<NodeSpec> {
    let context = format!("service {service_index} node {index}");

    let protocol = node
        .protocol
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("{context}: protocol is missing")))?;
    let (transport, application) = parse_protocols(protocol)
        .ok_or_else(|| Error::Validation(format!("{context}: invalid protocol '{protocol}'")))?;

    let host = node
        .host
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("{context}: host is missing")))?;
    let host: IpAddr = host
        .parse()
        .map_err(|_| Error::Validation(format!("{context}: invalid host address '{host}'")))?;

    let port = match node.port {
        Some(port) if port != 0 => port,
        _ => return Err(Error::Validation(format!("{context}: port is missing or 0"))),
    };

    Ok(NodeSpec {
        name: node.name.clone().filter(|name| !name.is_empty()),
        transport,
        application,
        host,
        port,
    })
}

/// Map a protocol token to its transport and application layers.
pub fn parse_protocols(token: &str) -> Option<(Transport, Application)> {
    match token.to_ascii_lowercase().as_str() {
        "tcp" => Some((Transport::Tcp, Application::None)),
        "udp" => Some((Transport::Udp, Application::None)),
        "http" => Some((Transport::Tcp, Application::Http)),
        "https" => Some((Transport::Tcp, Application::Https)),
        _ => None,
    }
}

/// Map a balancing token to an algorithm. The empty string means the
/// default.
pub fn parse_balancing(token: &str) -> Option<Algorithm> {
    let token: String = token
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    match token.as_str() {
        "" | "roundrobin" | "rr" => Some(Algorithm::RoundRobin),
        "connectioncount" | "cc" => Some(Algorithm::ConnectionCount),
        _ => None,
    }
}

/// Parse a session lifetime: `<int>` seconds, with an optional `s`, `m`,
/// `h` or `d` unit; whitespace-insensitive; empty, `disabled` and `false`
/// mean disabled. `None` on anything else.
pub fn parse_session(token: &str) -> Option<Duration> {
    let token: String = token
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if token.is_empty() || token == "disabled" || token == "false" {
        return Some(Duration::ZERO);
    }

    let digits_end = token.find(|c: char| !c.is_ascii_digit()).unwrap_or(token.len());
    if digits_end == 0 {
        return None;
    }
    let value: u64 = token[..digits_end].parse().ok()?;
    let multiplier = match &token[digits_end..] {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => return None,
    };
    Some(Duration::from_secs(value * multiplier))
}
