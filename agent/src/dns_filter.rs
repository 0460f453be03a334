//! The recursing DNS filter: while lockdown is active, this is the only
//! resolver any local process can reach.
//!
//! One receive loop, one task per query. Allowed names are forwarded to the
//! upstream verbatim from an ephemeral socket and the answer is relayed
//! unchanged; everything else gets a synthesized NXDOMAIN. Parse failures
//! are dropped so the client times out and retries.

pub mod wire;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::settings::Settings;

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub bind: SocketAddr,
    pub upstream: SocketAddr,
    pub allow_domains: Vec<String>,
    pub upstream_timeout: Duration,
}

impl FilterConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind: settings.dns_bind,
            upstream: settings.upstream_dns,
            allow_domains: settings.allow_domains.clone(),
            upstream_timeout: UPSTREAM_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// Port contention is an expected failure mode the coordinator reacts to
    /// by stopping the system DNS cache service, so it gets its own variant.
    #[error("UDP port {0} is already taken")]
    PortInUse(SocketAddr),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct DnsFilter {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl DnsFilter {
    /// Binds the socket and starts serving. The caller decides what to do
    /// about port contention.
    pub async fn start(config: FilterConfig) -> Result<Self, StartError> {
        let socket = match UdpSocket::bind(config.bind).await {
            Ok(socket) => socket,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(StartError::PortInUse(config.bind));
            }
            Err(e) => return Err(StartError::Io(e)),
        };
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(serve(Arc::new(socket), Arc::new(config), shutdown_rx));
        tracing::info!(%local_addr, "DNS filter listening");

        Ok(Self {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

async fn serve(
    socket: Arc<UdpSocket>,
    config: Arc<FilterConfig>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    let datagram = buf[..len].to_vec();
                    tokio::spawn(handle_query(
                        Arc::clone(&socket),
                        Arc::clone(&config),
                        datagram,
                        peer,
                    ));
                }
                // Transient receive errors must not take the loop down.
                Err(error) => tracing::warn!("DNS receive failed: {error}"),
            }
        }
    }
    tracing::info!("DNS filter stopped");
}

async fn handle_query(
    socket: Arc<UdpSocket>,
    config: Arc<FilterConfig>,
    datagram: Vec<u8>,
    peer: SocketAddr,
) {
    let reply = match wire::qname(&datagram) {
        Ok(name) if wire::is_allowed(&name, &config.allow_domains) => {
            match forward(&config, &datagram).await {
                Ok(answer) => answer,
                Err(error) => {
                    tracing::warn!(%name, "Upstream forward failed: {error:#}");
                    wire::nxdomain(&datagram)
                }
            }
        }
        Ok(name) => {
            tracing::debug!(%name, "Refusing query outside the allow set");
            wire::nxdomain(&datagram)
        }
        Err(wire::Error::Compressed) => wire::nxdomain(&datagram),
        Err(error) => {
            tracing::debug!("Dropping unparseable datagram: {error}");
            return;
        }
    };

    if let Err(error) = socket.send_to(&reply, peer).await {
        tracing::debug!(%peer, "Failed to send DNS reply: {error}");
    }
}

/// Forwards the query verbatim and returns the upstream's answer unchanged.
///
/// Each forward uses its own ephemeral socket so concurrent in-flight
/// queries cannot cross answers.
async fn forward(config: &FilterConfig, datagram: &[u8]) -> Result<Vec<u8>> {
    let bind: SocketAddr = match config.upstream {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)
        .await
        .context("Failed to bind an upstream socket")?;
    socket
        .send_to(datagram, config.upstream)
        .await
        .context("Failed to send to the upstream resolver")?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (len, _) = tokio::time::timeout(config.upstream_timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| anyhow!("No answer within {:?}", config.upstream_timeout))?
        .context("Failed to receive from the upstream resolver")?;
    buf.truncate(len);

    Ok(buf)
}
