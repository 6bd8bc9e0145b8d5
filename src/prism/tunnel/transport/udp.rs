use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_kcp::{KcpConfig, KcpListener, KcpStream};

use crate::prism::net;
use crate::prism::tunnel::transport::{
    DialOptions, ListenOptions, MuxSession, Transport, TransportListener, TransportSession,
    resolve_socket_addr,
};

/// UDP transport: KCP (reliable UDP with retransmit/congestion control)
/// carrying the same yamux multiplexer as the TCP transport.
pub struct UdpTransport {
    kcp: KcpConfig,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            kcp: KcpConfig::default(),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: ListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind: SocketAddr = net::normalize_bind_addr(addr).parse()?;
        let ln = KcpListener::bind(self.kcp.clone(), bind).await?;
        let local = ln.local_addr().ok();
        Ok(Box::new(UdpTransportListener {
            ln: Mutex::new(ln),
            local,
        }))
    }

    async fn dial(&self, addr: &str, _opts: DialOptions) -> anyhow::Result<Arc<dyn TransportSession>> {
        let remote = resolve_socket_addr(addr).await?;
        let c = KcpStream::connect(&self.kcp, remote).await?;
        Ok(Arc::new(MuxSession::new(c, false, Some(remote))))
    }
}

pub struct UdpTransportListener {
    ln: Mutex<KcpListener>,
    local: Option<SocketAddr>,
}

#[async_trait]
impl TransportListener for UdpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let mut ln = self.ln.lock().await;
        let (c, peer) = ln.accept().await?;
        Ok(Arc::new(MuxSession::new(c, true, Some(peer))))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
