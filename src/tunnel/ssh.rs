//! Forwarding through the system ssh client

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{ForwardSpec, Forwarder, TunnelError, TunnelHandle};
use crate::config::TunnelConfig;

/// How often readiness is re-checked while ssh starts
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawns `ssh -N -L ...` per forward
pub struct SshForwarder {
    config: TunnelConfig,
}

impl SshForwarder {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to the ssh client for one forward
    fn args(&self, spec: &ForwardSpec) -> Vec<String> {
        let connect_timeout_secs = self.config.connect_timeout_ms.div_ceil(1000).max(1);
        vec![
            "-N".to_string(),
            "-L".to_string(),
            format!(
                "127.0.0.1:{}:{}:{}",
                spec.local_port, spec.target.host, spec.target.port
            ),
            "-i".to_string(),
            self.config.identity_file.clone(),
            "-p".to_string(),
            self.config.ssh_port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout_secs),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.config.keepalive_interval_secs),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            format!("{}@{}", self.config.username, spec.jump_host),
        ]
    }

    /// Poll until the local port accepts a connection or ssh gives up
    async fn wait_ready(&self, spec: &ForwardSpec, child: &mut Child) -> Result<(), TunnelError> {
        let timeout = Duration::from_millis(self.config.ready_timeout_ms);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(TunnelError::Spawn)? {
                return Err(TunnelError::Exited {
                    name: spec.name.clone(),
                    status: status.to_string(),
                });
            }
            if TcpStream::connect(("127.0.0.1", spec.local_port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::NotReady {
                    port: spec.local_port,
                    timeout,
                });
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Forwarder for SshForwarder {
    async fn open(
        &self,
        spec: &ForwardSpec,
        alive: Arc<AtomicBool>,
    ) -> Result<Box<dyn TunnelHandle>, TunnelError> {
        ensure_port_free(spec.local_port).await?;

        debug!(name = %spec.name, jump_host = %spec.jump_host, "Spawning ssh");
        let mut child = Command::new(&self.config.ssh_binary)
            .args(self.args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TunnelError::Spawn)?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(spec.name.clone(), stderr));
        }

        // On failure the child is dropped here and killed with it
        self.wait_ready(spec, &mut child).await?;

        alive.store(true, Ordering::Release);
        info!(
            name = %spec.name,
            local_port = spec.local_port,
            target = %spec.target,
            "Tunnel ready"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(spec.name.clone(), child, alive, stop_rx));
        Ok(Box::new(SshTunnel {
            name: spec.name.clone(),
            stop: Some(stop_tx),
            supervisor: Some(supervisor),
        }))
    }
}

/// Bind and release the port to make sure nothing else holds it
async fn ensure_port_free(port: u16) -> Result<(), TunnelError> {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(_) => Err(TunnelError::PortInUse { port }),
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(name = %name, "ssh: {}", line);
    }
}

/// Watch the ssh child until it exits or a stop is requested
async fn supervise(
    name: String,
    mut child: Child,
    alive: Arc<AtomicBool>,
    stop: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop => None,
    };
    alive.store(false, Ordering::Release);

    match exited {
        Some(status) => {
            match &status {
                Ok(status) => warn!(name = %name, status = %status, "ssh exited, tunnel down"),
                Err(e) => warn!(name = %name, error = %e, "Lost track of ssh, tunnel down"),
            }
            status.map(|_| ())
        }
        None => {
            debug!(name = %name, "Stopping ssh");
            child.kill().await
        }
    }
}

/// Handle to a supervised ssh process
struct SshTunnel {
    name: String,
    stop: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<std::io::Result<()>>>,
}

#[async_trait]
impl TunnelHandle for SshTunnel {
    async fn close(&mut self) -> Result<(), TunnelError> {
        if let Some(stop) = self.stop.take() {
            // The supervisor may already be gone if ssh exited on its own
            let _ = stop.send(());
        }
        let Some(supervisor) = self.supervisor.take() else {
            return Ok(());
        };
        match supervisor.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TunnelError::Close {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
            Err(e) => Err(TunnelError::Close {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
