use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// The single authoritative database, always directly reachable
    pub primary: EndpointConfig,
    /// Read replicas, each reachable only through its own SSH forward
    #[serde(default)]
    pub secondaries: Vec<EndpointConfig>,
    pub tunnel: TunnelConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    8080
}

/// A database endpoint as written by the operator.
///
/// For the primary, `host:port` is the MySQL address. For a secondary,
/// `host` is the SSH jump host and `port` is the local forwarding port.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

// ============================================================================
// Tunnel Configuration
// ============================================================================

/// SSH forwarding configuration shared by all secondaries
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Private key passed to `ssh -i`
    pub identity_file: String,
    /// Login user on the secondary hosts
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// ssh client executable
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    /// SSH connection establishment timeout (milliseconds)
    #[serde(default = "default_tunnel_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for the local forward to accept connections (milliseconds)
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// ServerAliveInterval for the ssh client (seconds)
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Abort startup if any tunnel fails to come up
    #[serde(default)]
    pub require_all: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_tunnel_connect_timeout_ms() -> u64 {
    10000
}

fn default_ready_timeout_ms() -> u64 {
    15000
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

// ============================================================================
// Database Configuration
// ============================================================================

/// Credentials and the fixed read query run against the chosen endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Default schema
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default = "default_db_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_query() -> String {
    "SELECT * FROM store LIMIT 25".to_string()
}

fn default_db_connect_timeout_ms() -> u64 {
    3000
}

fn default_query_timeout_ms() -> u64 {
    5000
}

// ============================================================================
// Probe / Routing Configuration
// ============================================================================

/// How a single latency sample is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// TCP connect and wait for the server greeting packet
    #[default]
    Greeting,
    /// TCP connect only
    Connect,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub method: ProbeMethod,
    #[serde(default = "default_sample_count")]
    pub sample_count: u32,
    #[serde(default = "default_per_sample_timeout_ms")]
    pub per_sample_timeout_ms: u64,
    /// Deadline for a whole fan-out; defaults to sample_count * per_sample_timeout_ms
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

fn default_sample_count() -> u32 {
    4
}

fn default_per_sample_timeout_ms() -> u64 {
    2000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: ProbeMethod::default(),
            sample_count: default_sample_count(),
            per_sample_timeout_ms: default_per_sample_timeout_ms(),
            deadline_ms: None,
        }
    }
}

impl ProbeConfig {
    pub fn effective_deadline_ms(&self) -> u64 {
        self.deadline_ms
            .unwrap_or((self.sample_count as u64).saturating_mul(self.per_sample_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Retry on the primary when a secondary connection fails
    #[serde(default)]
    pub fallback_to_primary: bool,
    /// Upper bound for one routed request (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    15000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fallback_to_primary: false,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// HTTP listen address (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}
