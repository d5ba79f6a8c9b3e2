//! Tunnel lifecycle and the binding table

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{ForwardSpec, Forwarder, TunnelError, TunnelHandle};
use crate::cluster::{Address, Endpoint};
use crate::config::check_local_ports;
use crate::metrics::metrics;

/// One secondary's forward
///
/// The local port equals the secondary's configured port. `alive` is cleared
/// when the forward stops, either at shutdown or because ssh died.
pub struct TunnelBinding {
    secondary: Arc<Endpoint>,
    alive: Arc<AtomicBool>,
    handle: Mutex<Option<Box<dyn TunnelHandle>>>,
}

impl TunnelBinding {
    pub fn new(
        secondary: Arc<Endpoint>,
        alive: Arc<AtomicBool>,
        handle: Box<dyn TunnelHandle>,
    ) -> Self {
        Self {
            secondary,
            alive,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.secondary.port
    }

    pub fn local_addr(&self) -> Address {
        Address::loopback(self.local_port())
    }

    pub fn is_ready(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Close the forward once; later calls are no-ops
    async fn close(&self) -> Result<(), TunnelError> {
        let handle = self.handle.lock().take();
        self.alive.store(false, Ordering::Release);
        match handle {
            Some(mut handle) => handle.close().await,
            None => Ok(()),
        }
    }
}

/// Bindings by secondary name, built once at startup
#[derive(Default)]
pub struct TunnelTable {
    bindings: HashMap<String, Arc<TunnelBinding>>,
}

impl TunnelTable {
    pub fn from_bindings(bindings: impl IntoIterator<Item = TunnelBinding>) -> Self {
        Self {
            bindings: bindings
                .into_iter()
                .map(|b| (b.secondary.name.clone(), Arc::new(b)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TunnelBinding>> {
        self.bindings.get(name)
    }

    /// Local address of a forward that is currently usable
    pub fn ready_addr(&self, name: &str) -> Option<Address> {
        self.get(name)
            .filter(|b| b.is_ready())
            .map(|b| b.local_addr())
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.get(name).is_some_and(|b| b.is_ready())
    }

    pub fn ready_count(&self) -> usize {
        self.bindings.values().filter(|b| b.is_ready()).count()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Outcome of starting every tunnel
pub struct StartReport {
    pub table: TunnelTable,
    /// Secondaries whose forward could not be opened
    pub failures: Vec<(String, TunnelError)>,
}

/// Opens and closes the forwards for all secondaries
pub struct TunnelManager {
    forwarder: Arc<dyn Forwarder>,
}

impl TunnelManager {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self { forwarder }
    }

    /// Open one forward per secondary, all at once
    ///
    /// A failing secondary does not stop the others; it is reported in
    /// `failures` and left out of the table. Duplicate local ports fail the
    /// whole call before anything is opened.
    pub async fn start(
        &self,
        secondaries: &[Arc<Endpoint>],
        primary: &Endpoint,
    ) -> Result<StartReport, TunnelError> {
        check_local_ports(secondaries.iter().map(|s| (s.name.as_str(), s.port)))?;

        let target = primary.addr();
        let opens = secondaries.iter().map(|secondary| {
            let spec = ForwardSpec {
                name: secondary.name.clone(),
                local_port: secondary.port,
                jump_host: secondary.host.clone(),
                target: target.clone(),
            };
            let forwarder = self.forwarder.clone();
            async move {
                let alive = Arc::new(AtomicBool::new(false));
                let result = forwarder.open(&spec, alive.clone()).await;
                (secondary, alive, result)
            }
        });

        let mut bindings = Vec::with_capacity(secondaries.len());
        let mut failures = Vec::new();
        for (secondary, alive, result) in join_all(opens).await {
            match result {
                Ok(handle) => bindings.push(TunnelBinding::new(secondary.clone(), alive, handle)),
                Err(e) => {
                    error!(name = %secondary.name, error = %e, "Failed to open tunnel");
                    failures.push((secondary.name.clone(), e));
                }
            }
        }

        let table = TunnelTable::from_bindings(bindings);
        info!(
            ready = table.ready_count(),
            failed = failures.len(),
            "Tunnels started"
        );
        metrics().set_tunnels_ready(table.ready_count());
        Ok(StartReport { table, failures })
    }

    /// Close every forward in the table
    ///
    /// Failures are logged and do not stop the remaining closes. Calling this
    /// again closes nothing.
    pub async fn stop(&self, table: &TunnelTable) {
        let closes = table.bindings.values().map(|binding| async move {
            if let Err(e) = binding.close().await {
                warn!(name = %binding.secondary.name, error = %e, "Error closing tunnel");
            }
        });
        join_all(closes).await;
        metrics().set_tunnels_ready(table.ready_count());
        info!("Tunnels stopped");
    }
}
