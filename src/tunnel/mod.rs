//! SSH port forwarding to the primary through each secondary
//!
//! Every secondary gets one forward `127.0.0.1:<port> -> primary` opened at
//! startup and closed once at shutdown. Requests only read the resulting
//! binding table.

mod manager;
mod ssh;

pub use manager::{StartReport, TunnelBinding, TunnelManager, TunnelTable};
pub use ssh::SshForwarder;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cluster::Address;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Local port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("Failed to start ssh: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ssh for '{name}' exited before the forward was ready ({status})")]
    Exited { name: String, status: String },

    #[error("Forward on local port {port} not ready after {timeout:?}")]
    NotReady { port: u16, timeout: Duration },

    #[error("Failed to stop tunnel '{name}': {reason}")]
    Close { name: String, reason: String },
}

/// What one forward connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    /// Secondary name, for logs
    pub name: String,
    /// Port bound on 127.0.0.1
    pub local_port: u16,
    /// SSH host the forward goes through
    pub jump_host: String,
    /// Where the jump host connects to
    pub target: Address,
}

/// Opens forwarding channels
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Open a forward and return once the local port accepts connections.
    ///
    /// `alive` must be set while the forward is usable and cleared as soon
    /// as it stops forwarding.
    async fn open(
        &self,
        spec: &ForwardSpec,
        alive: Arc<AtomicBool>,
    ) -> Result<Box<dyn TunnelHandle>, TunnelError>;
}

/// An open forwarding channel
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    async fn close(&mut self) -> Result<(), TunnelError>;
}
