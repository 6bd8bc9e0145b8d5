use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::io::AsyncWriteExt;

use crate::prism::tunnel::{
    datagram::DatagramConn,
    protocol::{self, ProxyStreamKind, RegisterRequest, RegisteredService},
    transport::{BoxedStream, DialOptions, QuicDialOptions, transport_by_name},
};

#[derive(Debug, Clone, Default)]
pub struct QuicClientOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub transport: String,
    pub auth_token: String,
    pub services: Vec<RegisteredService>,
    pub dial_timeout: Duration,
    pub quic: QuicClientOptions,
}

/// The tunnel agent: dials the gateway, registers its services, then serves
/// gateway-opened proxy streams against local backends. Reconnects with
/// exponential backoff (capped at 10s) until shut down.
pub struct Client {
    opts: ClientOptions,
    local: Arc<HashMap<String, RegisteredService>>,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }

        let mut map = HashMap::new();
        let mut services = Vec::new();
        for s in opts.services.drain(..) {
            let Some(ns) = s.normalize() else { continue };
            if ns.local_addr.is_empty() {
                tracing::warn!(service = %ns.name, "tunnel: skipping service without local_addr");
                continue;
            }
            map.insert(ns.name.clone(), ns.clone());
            services.push(ns);
        }
        if services.is_empty() {
            anyhow::bail!("tunnel: client has no usable services");
        }
        opts.services = services;

        Ok(Self {
            opts,
            local: Arc::new(map),
        })
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        transport = %self.opts.transport,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let tr = transport_by_name(&self.opts.transport)?;

        let dial = tr.dial(
            &self.opts.server_addr,
            DialOptions {
                quic: QuicDialOptions {
                    server_name: self.opts.quic.server_name.clone(),
                    insecure_skip_verify: self.opts.quic.insecure_skip_verify,
                },
            },
        );
        let sess = tokio::time::timeout(self.opts.dial_timeout, dial).await??;

        // Register on the first stream, then keep the session for proxying.
        let mut reg = sess.open_stream().await?;
        protocol::write_register_request(
            &mut reg,
            &RegisterRequest {
                token: self.opts.auth_token.clone(),
                services: self.opts.services.clone(),
            },
        )
        .await?;
        reg.shutdown().await?;
        drop(reg);

        tracing::info!(
            server = %self.opts.server_addr,
            transport = %tr.name(),
            services = self.opts.services.len(),
            "tunnel: connected"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        sess.close().await;
                        return Ok(());
                    }
                }
                st = sess.accept_stream() => {
                    let st = st?;
                    let local = self.local.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_proxy_stream(local, st).await {
                            tracing::debug!(err = %err, "tunnel: proxy stream ended");
                        }
                    });
                }
            }
        }
    }
}

/// Handle one gateway-opened proxy stream: read the header, dial the local
/// backend, relay. Stream errors never tear the session down.
async fn serve_proxy_stream(
    local: Arc<HashMap<String, RegisteredService>>,
    mut st: BoxedStream,
) -> anyhow::Result<()> {
    let (kind, service) = protocol::read_proxy_stream_header(&mut st).await?;
    let Some(meta) = local.get(&service) else {
        tracing::warn!(service = %service, "tunnel: request for unknown service");
        return Ok(());
    };
    let local_addr = meta.local_addr.clone();

    match kind {
        ProxyStreamKind::Tcp => {
            let mut backend = tokio::net::TcpStream::connect(&local_addr).await?;
            let _ = tokio::io::copy_bidirectional(&mut st, &mut backend).await;
        }
        ProxyStreamKind::Udp => {
            relay_udp(st, &local_addr).await?;
        }
    }

    Ok(())
}

/// Unframe datagrams from the stream toward a local UDP socket and frame
/// responses symmetrically. One task per direction keeps frame reads whole.
async fn relay_udp(st: BoxedStream, local_addr: &str) -> anyhow::Result<()> {
    let sock = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    sock.connect(local_addr).await?;
    let sock = Arc::new(sock);

    let (mut rd, mut wr) = DatagramConn::new(st).split();

    let sock_out = sock.clone();
    let mut to_local = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = rd.read_datagram(&mut buf).await?;
            sock_out.send(&buf[..n]).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    let mut from_local = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = sock.recv(&mut buf).await?;
            wr.write_datagram(&buf[..n]).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    });

    // Whichever direction ends first tears the other down.
    tokio::select! {
        _ = &mut to_local => from_local.abort(),
        _ = &mut from_local => to_local.abort(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_opts() -> ClientOptions {
        ClientOptions {
            server_addr: "127.0.0.1:7000".into(),
            transport: "tcp".into(),
            auth_token: "".into(),
            services: vec![RegisteredService {
                name: "svc".into(),
                proto: "".into(),
                local_addr: "127.0.0.1:25565".into(),
                route_only: false,
                remote_addr: "".into(),
            }],
            dial_timeout: Duration::ZERO,
            quic: QuicClientOptions::default(),
        }
    }

    #[test]
    fn new_normalizes_and_defaults() {
        let c = Client::new(base_opts()).unwrap();
        assert_eq!(c.opts.dial_timeout, Duration::from_secs(5));
        assert_eq!(c.opts.services[0].proto, "tcp");
    }

    #[test]
    fn new_rejects_missing_server_or_services() {
        let mut o = base_opts();
        o.server_addr = "  ".into();
        assert!(Client::new(o).is_err());

        let mut o = base_opts();
        o.services.clear();
        assert!(Client::new(o).is_err());

        let mut o = base_opts();
        o.services[0].local_addr = "".into();
        assert!(Client::new(o).is_err());
    }
}
