//! Static endpoint topology: one primary and an ordered list of secondaries
//!
//! Built once from configuration and shared read-only for the process lifetime.

use std::fmt;
use std::sync::Arc;

use crate::config::{Config, ConfigError, EndpointConfig};

/// Role of an endpoint in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Primary,
    Secondary,
}

/// A network address (host may be a name or an IP)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback address of a local forwarding port
    pub fn loopback(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A database endpoint
///
/// For a secondary, `host` is the SSH jump host and `port` is the local
/// forwarding port bound on 127.0.0.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub kind: EndpointKind,
}

impl Endpoint {
    pub fn primary(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            kind: EndpointKind::Primary,
        }
    }

    pub fn secondary(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            kind: EndpointKind::Secondary,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.kind == EndpointKind::Primary
    }

    pub fn is_secondary(&self) -> bool {
        self.kind == EndpointKind::Secondary
    }

    /// Configured address (host:port)
    pub fn addr(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }
}

/// Immutable set of endpoints known to the router
#[derive(Debug, Clone)]
pub struct Cluster {
    primary: Arc<Endpoint>,
    secondaries: Vec<Arc<Endpoint>>,
}

impl Cluster {
    pub fn new(primary: Endpoint, secondaries: Vec<Endpoint>) -> Self {
        Self {
            primary: Arc::new(primary),
            secondaries: secondaries.into_iter().map(Arc::new).collect(),
        }
    }

    /// Build the topology from a configuration, validating it first
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let to_secondary =
            |c: &EndpointConfig| Endpoint::secondary(c.name.clone(), c.host.clone(), c.port);
        Ok(Self::new(
            Endpoint::primary(
                config.primary.name.clone(),
                config.primary.host.clone(),
                config.primary.port,
            ),
            config.secondaries.iter().map(to_secondary).collect(),
        ))
    }

    pub fn primary(&self) -> &Arc<Endpoint> {
        &self.primary
    }

    /// Secondaries in configured order
    pub fn secondaries(&self) -> &[Arc<Endpoint>] {
        &self.secondaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_kinds() {
        let p = Endpoint::primary("master", "10.0.0.1", 3306);
        let s = Endpoint::secondary("slave1", "10.0.0.2", 5001);
        assert!(p.is_primary());
        assert!(!p.is_secondary());
        assert!(s.is_secondary());
        assert_eq!(p.addr().to_string(), "10.0.0.1:3306");
        assert_eq!(Address::loopback(5001).to_string(), "127.0.0.1:5001");
    }

    #[test]
    fn test_from_config_preserves_order() {
        let toml = r#"
[server]
listen_addr = "127.0.0.1"

[primary]
name = "master"
host = "10.0.0.1"
port = 3306

[[secondaries]]
name = "slave2"
host = "10.0.0.3"
port = 5002

[[secondaries]]
name = "slave1"
host = "10.0.0.2"
port = 5001

[tunnel]
identity_file = "/tmp/key.pem"
username = "ubuntu"

[database]
user = "user0"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let cluster = Cluster::from_config(&config).unwrap();
        assert_eq!(cluster.primary().name, "master");
        let names: Vec<_> = cluster.secondaries().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["slave2", "slave1"]);
        assert!(cluster.secondaries().iter().all(|s| s.is_secondary()));
    }
}
