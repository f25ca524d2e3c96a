//! Configuration data types: the YAML grammar as serde structures.
//!
//! The grammar is permissive at this layer (everything optional, raw
//! strings for protocols and durations); semantic checks live in
//! [`crate::config::validation`], which turns these into typed specs with
//! indexed error messages.

use serde::{Deserialize, Serialize};

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Server-wide settings and the default-service template.
    #[serde(default)]
    pub server: ServerSection,

    /// Front-end services; a sequence or a single mapping.
    #[serde(default)]
    pub services: OneOrMany<ServiceSection>,
}

/// The `server:` mapping.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    /// Server-wide connection budget.
    #[serde(default = "default_server_max_connections")]
    pub max_connections: u16,

    /// Interprocess port. Reserved; parsed but unused.
    #[serde(default = "default_com_port")]
    pub com_port: u16,

    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Buffer pool sizing overrides for the default service template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferSection>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            max_connections: default_server_max_connections(),
            com_port: default_com_port(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            buffer: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Buffer pool sizing in the `server:` template.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BufferSection {
    /// Bytes per buffer.
    pub size: Option<usize>,
    /// Buffers preallocated per service.
    pub preallocation: Option<usize>,
    /// Upper bound on live buffers per service.
    pub max: Option<usize>,
    /// Reserve queue depth per service.
    pub reserve: Option<usize>,
    /// Buffers minted per refill cycle.
    pub batch: Option<usize>,
}

/// One entry under `services:`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceSection {
    /// Unique name; auto-generated when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// tcp | udp | http | https. Mandatory.
    pub protocol: Option<String>,

    /// Dotted-quad address to bind. Mandatory.
    pub host: Option<String>,

    /// Port to bind. Mandatory and non-zero.
    pub port: Option<u16>,

    /// roundrobin | rr | connectioncount | cc. Defaults to round-robin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balancing: Option<String>,

    /// Session lifetime: `<int>[s|m|h|d]`, or disabled/false/empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    /// Per-service peer budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    /// Reserved; parsed and ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<serde_yaml::Value>,

    /// Back-end nodes; a sequence or a single mapping.
    #[serde(default)]
    pub nodes: OneOrMany<NodeSection>,
}

/// One entry under a service's `nodes:`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeSection {
    /// Unique name; auto-generated when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// tcp | udp | http | https. Mandatory.
    pub protocol: Option<String>,

    /// Dotted-quad address. Mandatory.
    pub host: Option<String>,

    /// Port. Mandatory and non-zero.
    pub port: Option<u16>,
}

/// A YAML value that may be a single mapping or a sequence of them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item).iter(),
            OneOrMany::Many(items) => items.iter(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

fn default_server_max_connections() -> u16 {
    1024
}

fn default_com_port() -> u16 {
    240
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.max_connections, 1024);
        assert_eq!(config.server.com_port, 240);
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.server.log_format, LogFormat::Pretty);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_services_as_sequence() {
        let yaml = r#"
services:
  - protocol: tcp
    host: 0.0.0.0
    port: 9000
  - protocol: tcp
    host: 0.0.0.0
    port: 9001
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.services.len(), 2);
    }

    #[test]
    fn test_services_as_single_mapping() {
        let yaml = r#"
services:
  protocol: tcp
  host: 0.0.0.0
  port: 9000
  nodes:
    protocol: tcp
    host: 127.0.0.1
    port: 9100
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.services.len(), 1);
        let service = config.services.iter().next().unwrap();
        assert_eq!(service.port, Some(9000));
        assert_eq!(service.nodes.len(), 1);
    }

    #[test]
    fn test_monitor_is_tolerated() {
        let yaml = r#"
services:
  - protocol: tcp
    host: 0.0.0.0
    port: 9000
    monitor:
      interval: 5s
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.services.iter().next().unwrap().monitor.is_some());
    }
}
