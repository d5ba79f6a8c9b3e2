//! TCP reachability samples

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::{ProbeError, Prober};
use crate::cluster::Address;
use crate::config::ProbeMethod;
use crate::protocol::{is_err_packet, ErrPacket, PacketCodec};

/// Times a TCP connect, optionally up to the server's first packet
///
/// Waiting for the greeting matters for forwarded ports: the local ssh
/// listener accepts immediately, the greeting only arrives once the far
/// end has connected to the primary. A server that opens with an ERR
/// packet (host blocked, too many connections) fails the sample.
#[derive(Debug, Clone, Copy)]
pub struct TcpProber {
    method: ProbeMethod,
}

impl TcpProber {
    pub fn new(method: ProbeMethod) -> Self {
        Self { method }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn sample(&self, addr: &Address, limit: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        let exchange = async {
            let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
            if self.method == ProbeMethod::Greeting {
                let mut framed = Framed::new(stream, PacketCodec);
                let greeting = framed.next().await.ok_or(ProbeError::Closed)??;
                if is_err_packet(&greeting.payload) {
                    // Errors sent before the handshake carry no SQL state
                    let reason = ErrPacket::parse(&greeting.payload, 0)
                        .map(|e| format!("{} ({})", e.error_message, e.error_code))
                        .unwrap_or_else(|| "malformed error packet".to_string());
                    return Err(ProbeError::Rejected(reason));
                }
            }
            Ok::<(), ProbeError>(())
        };

        match timeout(limit, exchange).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProbeError::Timeout(limit)),
        }
    }
}
