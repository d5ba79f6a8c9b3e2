mod schema;

pub use schema::*;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("At least one secondary must be configured")]
    NoSecondaries,
    #[error("Endpoint name '{0}' is used more than once")]
    DuplicateName(String),
    #[error("Secondaries '{first}' and '{second}' both use local port {port}")]
    DuplicateLocalPort {
        port: u16,
        first: String,
        second: String,
    },
    #[error("Secondary '{name}' local port {port} collides with the HTTP listen port")]
    ListenPortConflict { name: String, port: u16 },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Check the startup invariants that would otherwise surface at request time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secondaries.is_empty() {
            return Err(ConfigError::NoSecondaries);
        }

        let mut names = HashSet::new();
        for endpoint in std::iter::once(&self.primary).chain(&self.secondaries) {
            if endpoint.name.is_empty() {
                return Err(ConfigError::Invalid("endpoint name must not be empty".into()));
            }
            if endpoint.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint '{}' has port 0",
                    endpoint.name
                )));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(ConfigError::DuplicateName(endpoint.name.clone()));
            }
        }

        check_local_ports(
            self.secondaries
                .iter()
                .map(|s| (s.name.as_str(), s.port)),
        )?;

        if let Some(s) = self
            .secondaries
            .iter()
            .find(|s| s.port == self.server.listen_port)
        {
            return Err(ConfigError::ListenPortConflict {
                name: s.name.clone(),
                port: s.port,
            });
        }

        if self.probe.sample_count == 0 {
            return Err(ConfigError::Invalid("probe.sample_count must be at least 1".into()));
        }
        if self.database.query.trim().is_empty() {
            return Err(ConfigError::Invalid("database.query must not be empty".into()));
        }

        Ok(())
    }
}

/// Reject two secondaries forwarding through the same local port
pub fn check_local_ports<'a, I>(secondaries: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (&'a str, u16)>,
{
    let mut seen: HashMap<u16, &str> = HashMap::new();
    for (name, port) in secondaries {
        if let Some(first) = seen.insert(port, name) {
            return Err(ConfigError::DuplicateLocalPort {
                port,
                first: first.to_string(),
                second: name.to_string(),
            });
        }
    }
    Ok(())
}
