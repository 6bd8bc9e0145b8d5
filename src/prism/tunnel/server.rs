use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::io::AsyncWriteExt;

use crate::prism::tunnel::{
    protocol,
    registry::Registry,
    transport::{
        ListenOptions, QuicListenOptions, TransportListener, TransportSession, transport_by_name,
    },
};

#[derive(Debug, Clone, Default)]
pub struct QuicServerOptions {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub auth_token: String,
    pub quic: QuicServerOptions,
    pub registry: Arc<Registry>,
}

/// Accepts tunnel sessions, enforces the registration handshake, and feeds
/// the service registry. One session per connecting client.
pub struct Server {
    opts: ServerOptions,
    ln: Box<dyn TransportListener>,
}

impl Server {
    pub async fn bind(opts: ServerOptions) -> anyhow::Result<Self> {
        let tr = transport_by_name(&opts.transport)?;
        let ln = tr
            .listen(
                &opts.listen_addr,
                ListenOptions {
                    quic: QuicListenOptions {
                        cert_file: opts.quic.cert_file.clone(),
                        key_file: opts.quic.key_file.clone(),
                    },
                },
            )
            .await?;

        tracing::info!(
            addr = %opts.listen_addr,
            transport = %tr.name(),
            "tunnel: listening"
        );

        Ok(Self { opts, ln })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr()
    }

    pub async fn serve(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                sess = self.ln.accept() => {
                    let sess = sess?;
                    let reg = self.opts.registry.clone();
                    let token = self.opts.auth_token.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_session(reg, sess, token).await {
                            tracing::warn!(err = %err, "tunnel: session ended with error");
                        }
                    });
                }
            }
        }

        self.ln.close().await?;
        Ok(())
    }
}

async fn handle_session(
    reg: Arc<Registry>,
    sess: Arc<dyn TransportSession>,
    auth_token: String,
) -> anyhow::Result<()> {
    let cid = reg.next_client_id();
    let remote = sess.remote_addr().map(|a| a.to_string()).unwrap_or_default();

    // The first stream carries the register request.
    let mut reg_stream = sess.accept_stream().await?;
    let req = protocol::read_register_request(&mut reg_stream).await?;
    drop(reg_stream);

    if !auth_token.trim().is_empty() && req.token != auth_token {
        tracing::warn!(client = %remote, "tunnel: registration rejected (bad token)");
        sess.close().await;
        return Ok(());
    }

    reg.register_client(cid.clone(), sess.clone(), req.services).await?;
    tracing::info!(cid = %cid, client = %remote, "tunnel: client registered");

    // The server never expects client-opened streams after registration; the
    // accept loop exists to observe disconnect and to dispose of strays.
    loop {
        match sess.accept_stream().await {
            Ok(mut stray) => {
                let _ = tokio::time::timeout(Duration::from_secs(1), stray.shutdown()).await;
            }
            Err(_) => break,
        }
    }

    reg.unregister_client(&cid).await;
    tracing::info!(cid = %cid, client = %remote, "tunnel: client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::prism::tunnel::client::{Client, ClientOptions, QuicClientOptions};

    async fn spawn_echo_backend() -> std::net::SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut s, _) = ln.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match s.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if s.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn register_dial_and_echo_over_tcp_tunnel() {
        let echo_addr = spawn_echo_backend().await;

        let registry = Arc::new(Registry::new());
        let server = Server::bind(ServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            transport: "tcp".into(),
            auth_token: "".into(),
            quic: QuicServerOptions::default(),
            registry: registry.clone(),
        })
        .await
        .unwrap();
        let server_addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        let client = Client::new(ClientOptions {
            server_addr: server_addr.to_string(),
            transport: "tcp".into(),
            auth_token: "".into(),
            services: vec![protocol::RegisteredService {
                name: "echo".into(),
                proto: "tcp".into(),
                local_addr: echo_addr.to_string(),
                route_only: false,
                remote_addr: "".into(),
            }],
            dial_timeout: Duration::from_secs(2),
            quic: QuicClientOptions::default(),
        })
        .unwrap();

        let client_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = client.run(client_shutdown).await;
        });

        // Wait for the registration to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !registry.has_service("echo").await {
            assert!(tokio::time::Instant::now() < deadline, "service never registered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut st = registry.dial_service("echo").await.unwrap();
        st.write_all(b"hello over tunnel").await.unwrap();
        st.flush().await.unwrap();
        let mut got = [0u8; 17];
        st.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello over tunnel");

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let registry = Arc::new(Registry::new());
        let server = Server::bind(ServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            transport: "tcp".into(),
            auth_token: "right".into(),
            quic: QuicServerOptions::default(),
            registry: registry.clone(),
        })
        .await
        .unwrap();
        let server_addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        let client = Client::new(ClientOptions {
            server_addr: server_addr.to_string(),
            transport: "tcp".into(),
            auth_token: "wrong".into(),
            services: vec![protocol::RegisteredService {
                name: "echo".into(),
                proto: "tcp".into(),
                local_addr: "127.0.0.1:1".into(),
                route_only: false,
                remote_addr: "".into(),
            }],
            dial_timeout: Duration::from_secs(2),
            quic: QuicClientOptions::default(),
        })
        .unwrap();

        let client_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = client.run(client_shutdown).await;
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!registry.has_service("echo").await);
        let _ = shutdown_tx.send(true);
    }
}
