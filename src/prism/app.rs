use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::task::JoinSet;

use crate::prism::{
    admin, bridge, config, dialer, logging, parser, proxy, reload, router, telemetry, tunnel,
};

/// Wire the whole gateway from the resolved config and run until shutdown.
///
/// Listener topology, admin address and the tunnel subsystem are frozen at
/// startup; reloads rotate the per-snapshot components (parsers, dialer,
/// bridge, route table, timeouts) atomically under live traffic.
pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let manager = Arc::new(reload::ConfigManager::load_initial(resolved.path.clone())?);
    let cfg = manager.current();

    let _logrt = logging::init(&cfg.logging)?;
    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let proxy_enabled = !cfg.listeners.is_empty();
    let tunnel_server_enabled = !cfg.tunnel.listeners.is_empty();
    let tunnel_client_enabled = cfg.tunnel.client.is_some() && !cfg.tunnel.services.is_empty();
    let admin_enabled = !cfg.admin_addr.is_empty();

    if !proxy_enabled && !tunnel_server_enabled && !tunnel_client_enabled {
        anyhow::bail!(
            "config: nothing to run (set listeners, tunnel.listeners, or tunnel.client + services)"
        );
    }

    tracing::info!(
        config = %resolved.path.display(),
        proxy_listeners = cfg.listeners.len(),
        routes = cfg.routes.len(),
        tunnel_listeners = cfg.tunnel.listeners.len(),
        tunnel_client = tunnel_client_enabled,
        admin_addr = %cfg.admin_addr,
        "prism: starting"
    );

    // Process-wide state.
    let metrics: telemetry::SharedMetrics = Arc::new(telemetry::MetricsCollector::new());
    let sessions: telemetry::SharedSessions = Arc::new(telemetry::SessionRegistry::new());
    let tracker = Arc::new(telemetry::ListenerTracker::new());
    let registry = Arc::new(tunnel::registry::Registry::new());
    let rtr = Arc::new(router::Router::new(&cfg.routes));

    // Per-snapshot components.
    let parser_set = parser::build_parser_set(&cfg.routing_parsers)
        .context("build routing parsers")?;
    let chain = parser_set.chain();
    let active_parsers = Arc::new(Mutex::new(Some(parser_set)));

    let make_dialer = {
        let registry = registry.clone();
        move |cfg: &config::Config| {
            dialer::Dialer::new(cfg.upstream_dial_timeout, Some(registry.clone()))
        }
    };
    let make_bridge =
        |cfg: &config::Config| Arc::new(bridge::Bridge::new(cfg.buffer_size, cfg.proxy_protocol_v2));
    let make_limits = |cfg: &config::Config| proxy::Limits {
        max_header_bytes: cfg.max_header_bytes,
        handshake_timeout: cfg.timeouts.handshake_timeout,
        idle_timeout: cfg.timeouts.idle_timeout,
    };

    let routing_state = Arc::new(ArcSwap::from_pointee(proxy::RoutingState {
        parser: chain,
        router: rtr.clone(),
        dialer: make_dialer(&cfg),
        bridge: make_bridge(&cfg),
        limits: make_limits(&cfg),
        metrics: metrics.clone(),
        sessions: sessions.clone(),
    }));

    // Forward-mode states keep their upstream frozen; the runtime parts rotate.
    let mut forward_states: Vec<(String, Arc<ArcSwap<proxy::ForwardState>>)> = Vec::new();
    let mut udp_states: Vec<(String, Arc<ArcSwap<proxy::UdpForwardState>>)> = Vec::new();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Proxy listeners.
    for l in &cfg.listeners {
        match l.protocol.as_str() {
            "tcp" if l.upstream.is_empty() => {
                let listen_addr = l.listen_addr.clone();
                let handler = proxy::TcpHandler::Routing(routing_state.clone());
                let tracker = tracker.clone();
                let shutdown = shutdown_rx.clone();
                tasks.spawn(async move {
                    proxy::serve_tcp(&listen_addr, handler, Some(tracker), shutdown).await
                });
            }
            "tcp" => {
                let state = Arc::new(ArcSwap::from_pointee(proxy::ForwardState {
                    upstream: l.upstream.clone(),
                    dialer: make_dialer(&cfg),
                    bridge: make_bridge(&cfg),
                    limits: make_limits(&cfg),
                    metrics: metrics.clone(),
                    sessions: sessions.clone(),
                }));
                forward_states.push((l.upstream.clone(), state.clone()));

                let listen_addr = l.listen_addr.clone();
                let tracker = tracker.clone();
                let shutdown = shutdown_rx.clone();
                tasks.spawn(async move {
                    proxy::serve_tcp(
                        &listen_addr,
                        proxy::TcpHandler::Forward(state),
                        Some(tracker),
                        shutdown,
                    )
                    .await
                });
            }
            "udp" => {
                let state = Arc::new(ArcSwap::from_pointee(proxy::UdpForwardState {
                    upstream: l.upstream.clone(),
                    dialer: make_dialer(&cfg),
                    idle_timeout: cfg.timeouts.idle_timeout,
                    metrics: metrics.clone(),
                    sessions: sessions.clone(),
                }));
                udp_states.push((l.upstream.clone(), state.clone()));

                let listen_addr = l.listen_addr.clone();
                let tracker = tracker.clone();
                let shutdown = shutdown_rx.clone();
                tasks.spawn(async move {
                    proxy::serve_udp(&listen_addr, state, Some(tracker), shutdown).await
                });
            }
            other => {
                tracing::warn!(listen_addr = %l.listen_addr, protocol = %other, "unsupported listener protocol");
            }
        }
    }

    // Tunnel gateway side.
    let mut auto_listener: Option<Arc<tunnel::autolisten::AutoListener>> = None;
    let mut auto_runtime: Option<Arc<ArcSwap<tunnel::autolisten::AutoListenRuntime>>> = None;
    if tunnel_server_enabled {
        for tl in &cfg.tunnel.listeners {
            let server = tunnel::server::Server::bind(tunnel::server::ServerOptions {
                listen_addr: tl.listen_addr.clone(),
                transport: tl.transport.clone(),
                auth_token: cfg.tunnel.auth_token.clone(),
                quic: tunnel::server::QuicServerOptions {
                    cert_file: tl.quic.cert_file.clone(),
                    key_file: tl.quic.key_file.clone(),
                },
                registry: registry.clone(),
            })
            .await?;

            let shutdown = shutdown_rx.clone();
            let guard = tracker.listener_up();
            tasks.spawn(async move {
                let _guard = guard;
                server.serve(shutdown).await
            });
        }

        if cfg.tunnel.auto_listen_services {
            let runtime = Arc::new(ArcSwap::from_pointee(tunnel::autolisten::AutoListenRuntime {
                dialer: make_dialer(&cfg),
                bridge: make_bridge(&cfg),
                limits: make_limits(&cfg),
                metrics: metrics.clone(),
                sessions: sessions.clone(),
            }));
            let al = Arc::new(tunnel::autolisten::AutoListener::new(
                registry.clone(),
                runtime.clone(),
            ));
            auto_runtime = Some(runtime);
            auto_listener = Some(al.clone());

            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { al.run(shutdown).await });
        }
    }

    // Tunnel agent side.
    if tunnel_client_enabled {
        let cc = cfg.tunnel.client.as_ref().expect("checked above");
        let services = cfg
            .tunnel
            .services
            .iter()
            .map(|s| tunnel::protocol::RegisteredService {
                name: s.name.clone(),
                proto: s.proto.clone(),
                local_addr: s.local_addr.clone(),
                route_only: s.route_only,
                remote_addr: s.remote_addr.clone(),
            })
            .collect();

        let client = tunnel::client::Client::new(tunnel::client::ClientOptions {
            server_addr: cc.server_addr.clone(),
            transport: cc.transport.clone(),
            auth_token: cfg.tunnel.auth_token.clone(),
            services,
            dial_timeout: cc.dial_timeout,
            quic: tunnel::client::QuicClientOptions {
                server_name: cc.quic.server_name.clone(),
                insecure_skip_verify: cc.quic.insecure_skip_verify,
            },
        })?;

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    // Admin surface.
    if admin_enabled {
        let bind = crate::prism::net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid admin_addr {:?}", cfg.admin_addr))?;
        let state = admin::AdminState {
            metrics: metrics.clone(),
            sessions: sessions.clone(),
            tracker: tracker.clone(),
            manager: manager.clone(),
            registry: Some(registry.clone()),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(addr, state, shutdown).await });
    }

    // Snapshot rotation on every successful reload.
    {
        let rtr = rtr.clone();
        let routing_state = routing_state.clone();
        let forward_states = forward_states.clone();
        let udp_states = udp_states.clone();
        let metrics = metrics.clone();
        let sessions = sessions.clone();
        let active_parsers = active_parsers.clone();
        let auto_listener = auto_listener.clone();
        let auto_runtime = auto_runtime.clone();
        let make_dialer = make_dialer.clone();

        manager.subscribe(move |old, new| {
            if topology_changed(old, new) {
                tracing::warn!(
                    "reload: listener/admin/tunnel topology changed; restart required to apply"
                );
            }

            let new_set = match parser::build_parser_set(&new.routing_parsers) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(err = %err, "reload: rebuilding routing parsers failed; keeping previous chain");
                    return;
                }
            };
            let chain = new_set.chain();

            rtr.update(&new.routes);

            let dialer = make_dialer(new);
            let bridge = Arc::new(bridge::Bridge::new(new.buffer_size, new.proxy_protocol_v2));
            let limits = proxy::Limits {
                max_header_bytes: new.max_header_bytes,
                handshake_timeout: new.timeouts.handshake_timeout,
                idle_timeout: new.timeouts.idle_timeout,
            };

            routing_state.store(Arc::new(proxy::RoutingState {
                parser: chain,
                router: rtr.clone(),
                dialer: dialer.clone(),
                bridge: bridge.clone(),
                limits: limits.clone(),
                metrics: metrics.clone(),
                sessions: sessions.clone(),
            }));

            for (upstream, state) in &forward_states {
                state.store(Arc::new(proxy::ForwardState {
                    upstream: upstream.clone(),
                    dialer: dialer.clone(),
                    bridge: bridge.clone(),
                    limits: limits.clone(),
                    metrics: metrics.clone(),
                    sessions: sessions.clone(),
                }));
            }
            for (upstream, state) in &udp_states {
                state.store(Arc::new(proxy::UdpForwardState {
                    upstream: upstream.clone(),
                    dialer: dialer.clone(),
                    idle_timeout: limits.idle_timeout,
                    metrics: metrics.clone(),
                    sessions: sessions.clone(),
                }));
            }

            if let (Some(al), Some(rt)) = (&auto_listener, &auto_runtime) {
                rt.store(Arc::new(tunnel::autolisten::AutoListenRuntime {
                    dialer: dialer.clone(),
                    bridge: bridge.clone(),
                    limits: limits.clone(),
                    metrics: metrics.clone(),
                    sessions: sessions.clone(),
                }));
                let al = al.clone();
                tokio::spawn(async move { al.refresh_runtime().await });
            }

            // Retire the replaced sandboxed parsers once in-flight handshakes
            // have had time to finish.
            let retired = active_parsers.lock().unwrap().replace(new_set);
            if let Some(retired) = retired {
                let grace = old
                    .timeouts
                    .handshake_timeout
                    .max(Duration::from_millis(1))
                    * 2;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    retired.close();
                });
            }
        });
    }

    // Config watch loop.
    {
        let manager = manager.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            manager.run(shutdown).await;
            Ok(())
        });
    }

    // Run until a signal arrives or a task fails.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal received");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain; hard cap so container stops don't stall.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Startup-frozen sections: listeners, admin address, tunnel subsystem.
fn topology_changed(old: &config::Config, new: &config::Config) -> bool {
    if old.admin_addr != new.admin_addr {
        return true;
    }
    if old.listeners.len() != new.listeners.len() {
        return true;
    }
    for (a, b) in old.listeners.iter().zip(new.listeners.iter()) {
        if a.listen_addr != b.listen_addr || a.protocol != b.protocol || a.upstream != b.upstream {
            return true;
        }
    }
    if old.tunnel.listeners.len() != new.tunnel.listeners.len() {
        return true;
    }
    for (a, b) in old.tunnel.listeners.iter().zip(new.tunnel.listeners.iter()) {
        if a.listen_addr != b.listen_addr || a.transport != b.transport {
            return true;
        }
    }
    if old.tunnel.client.is_some() != new.tunnel.client.is_some() {
        return true;
    }
    false
}
