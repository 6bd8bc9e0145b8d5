use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc};

pub mod quic;
pub mod tcp;
pub mod udp;

/// A bidirectional async byte stream behind one trait object.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Default)]
pub struct QuicListenOptions {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct QuicDialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    pub quic: QuicListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub quic: QuicDialOptions,
}

/// A stream-multiplexing tunnel transport.
///
/// All transports share the session/stream semantics, so everything above
/// this layer is transport-agnostic.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str, opts: ListenOptions)
    -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str, opts: DialOptions) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        "udp" => Ok(Arc::new(udp::UdpTransport::new())),
        "quic" => Ok(Arc::new(quic::QuicTransport::new())),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|udp|quic)"),
    }
}

pub(crate) const TUNNEL_ALPN: &[u8] = b"prism-tunnel";

/// Yamux-backed session shared by the tcp and udp (kcp) transports.
pub(crate) struct MuxSession {
    control: Mutex<tokio_yamux::Control>,
    incoming: Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl MuxSession {
    pub(crate) fn new<T>(io: T, server: bool, remote: Option<SocketAddr>) -> Self
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = if server {
            tokio_yamux::Session::new_server(io, tokio_yamux::Config::default())
        } else {
            tokio_yamux::Session::new_client(io, tokio_yamux::Config::default())
        };
        let control = session.control();

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            control: Mutex::new(control),
            incoming: Mutex::new(rx),
            remote,
            task,
        }
    }
}

#[async_trait]
impl TransportSession for MuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(st))
    }

    async fn close(&self) {
        self.task.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

pub(crate) async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("tunnel: could not resolve {addr:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_transport_session_stream_roundtrip() {
        let tr = tcp::TcpTransport::new();
        let ln = tr
            .listen("127.0.0.1:0", ListenOptions::default())
            .await
            .unwrap();
        let addr = ln.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let sess = ln.accept().await.unwrap();
            let mut st = sess.accept_stream().await.unwrap();
            let mut buf = [0u8; 4];
            st.read_exact(&mut buf).await.unwrap();
            st.write_all(&buf).await.unwrap();
            st.flush().await.unwrap();
            // Hold the session so the stream stays open.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            sess.close().await;
        });

        let sess = tr
            .dial(&addr.to_string(), DialOptions::default())
            .await
            .unwrap();
        let mut st = sess.open_stream().await.unwrap();
        st.write_all(b"ping").await.unwrap();
        st.flush().await.unwrap();
        let mut buf = [0u8; 4];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        sess.close().await;
        accept.await.unwrap();
    }

    #[test]
    fn unknown_transport_rejected() {
        assert!(transport_by_name("sctp").is_err());
        assert!(transport_by_name("").is_ok());
        assert_eq!(transport_by_name("QUIC").unwrap().name(), "quic");
    }
}
