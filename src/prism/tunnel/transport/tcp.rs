use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::prism::net;
use crate::prism::tunnel::transport::{
    DialOptions, ListenOptions, MuxSession, Transport, TransportListener, TransportSession,
};

/// TCP carrying a yamux multiplexer.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: ListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind.as_ref()).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str, _opts: DialOptions) -> anyhow::Result<Arc<dyn TransportSession>> {
        let c = TcpStream::connect(addr).await?;
        let remote = c.peer_addr().ok();
        Ok(Arc::new(MuxSession::new(c, false, remote)))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (c, peer) = self.ln.accept().await?;
        Ok(Arc::new(MuxSession::new(c, true, Some(peer))))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the listener closes the socket.
        Ok(())
    }
}
