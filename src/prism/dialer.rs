use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpStream, UdpSocket},
    time,
};

use crate::prism::net;
use crate::prism::tunnel::{
    datagram::DatagramConn,
    registry::Registry,
    transport::BoxedStream,
};

/// Opens upstream streams, intercepting the synthetic `tunnel:<service>`
/// address form and dispatching it to the tunnel service registry.
#[derive(Clone)]
pub struct Dialer {
    timeout: Duration,
    tunnel: Option<Arc<Registry>>,
}

/// A connected UDP upstream: either a plain socket or a datagram-framed
/// tunnel stream.
pub enum UdpUpstream {
    Socket(UdpSocket),
    Tunnel(DatagramConn<BoxedStream>),
}

impl Dialer {
    pub fn new(timeout: Duration, tunnel: Option<Arc<Registry>>) -> Self {
        Self { timeout, tunnel }
    }

    /// Dial a TCP (or tunnel) upstream.
    ///
    /// `default_port` is appended when the address carries none. Returns the
    /// stream and the label actually dialed.
    pub async fn dial(
        &self,
        upstream: &str,
        default_port: Option<u16>,
    ) -> anyhow::Result<(BoxedStream, String)> {
        let mut addr = upstream.trim().to_string();
        if addr.is_empty() {
            anyhow::bail!("empty upstream");
        }

        if let Some(service) = addr.strip_prefix("tunnel:") {
            let service = service.trim();
            if service.is_empty() {
                anyhow::bail!("tunnel upstream missing service name");
            }
            let reg = self
                .tunnel
                .as_ref()
                .context("tunnel upstream requested but tunnel subsystem is not configured")?;
            let st = reg
                .dial_service(service)
                .await
                .map_err(|e| anyhow::anyhow!("tunnel dial {service:?} failed: {e}"))?;
            return Ok((st, format!("tunnel:{service}")));
        }

        if let Some(p) = default_port {
            if net::needs_port(&addr) {
                addr = format!("{addr}:{p}");
            }
        }

        let stream = if self.timeout > Duration::from_millis(0) {
            time::timeout(self.timeout, TcpStream::connect(&addr))
                .await
                .with_context(|| format!("dial timeout {addr}"))??
        } else {
            TcpStream::connect(&addr).await?
        };

        Ok((Box::new(stream), addr))
    }

    /// Dial a UDP (or tunnel) upstream for datagram forwarding.
    pub async fn dial_udp(&self, upstream: &str) -> anyhow::Result<UdpUpstream> {
        let addr = upstream.trim();
        if addr.is_empty() {
            anyhow::bail!("empty udp upstream");
        }

        if let Some(service) = addr.strip_prefix("tunnel:") {
            let service = service.trim();
            if service.is_empty() {
                anyhow::bail!("tunnel upstream missing service name");
            }
            let reg = self
                .tunnel
                .as_ref()
                .context("tunnel upstream requested but tunnel subsystem is not configured")?;
            let st = reg
                .dial_service_udp(service)
                .await
                .map_err(|e| anyhow::anyhow!("tunnel udp dial {service:?} failed: {e}"))?;
            return Ok(UdpUpstream::Tunnel(DatagramConn::new(st)));
        }

        let sock = UdpSocket::bind("0.0.0.0:0").await?;
        sock.connect(addr)
            .await
            .with_context(|| format!("udp connect {addr}"))?;
        Ok(UdpUpstream::Socket(sock))
    }
}
