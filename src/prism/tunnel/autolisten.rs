use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, watch};

use crate::prism::{bridge, dialer, proxy, telemetry};
use crate::prism::tunnel::registry::Registry;

/// Per-snapshot pieces the auto-provisioned listeners forward with.
pub struct AutoListenRuntime {
    pub dialer: dialer::Dialer,
    pub bridge: Arc<bridge::Bridge>,
    pub limits: proxy::Limits,
    pub metrics: telemetry::SharedMetrics,
    pub sessions: telemetry::SharedSessions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Desired {
    proto: String,
    addr: String,
}

struct Running {
    desired: Desired,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    tcp_state: Option<Arc<ArcSwap<proxy::ForwardState>>>,
    udp_state: Option<Arc<ArcSwap<proxy::UdpForwardState>>>,
}

/// Reconciles tunnel registrations against live public listeners.
///
/// A service's latest registration wins: when it carries a `remote_addr` and
/// is not `route_only`, a listener is kept open forwarding to the synthetic
/// upstream `tunnel:<name>`. Listeners for vanished or changed registrations
/// are shut down on the next reconcile. Per-listener failures log and skip.
pub struct AutoListener {
    registry: Arc<Registry>,
    runtime: Arc<ArcSwap<AutoListenRuntime>>,
    running: Mutex<HashMap<String, Running>>,
}

impl AutoListener {
    pub fn new(registry: Arc<Registry>, runtime: Arc<ArcSwap<AutoListenRuntime>>) -> Self {
        Self {
            registry,
            runtime,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut sub = self.registry.subscribe();
        self.reconcile().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = sub.changed() => {
                    self.reconcile().await;
                }
            }
        }

        self.shutdown_all().await;
        Ok(())
    }

    /// Re-point every running listener at the current runtime (fresh dialer,
    /// bridge and limits) after a snapshot swap.
    pub async fn refresh_runtime(&self) {
        let running = self.running.lock().await;
        for (name, r) in running.iter() {
            let rt = self.runtime.load();
            if let Some(st) = &r.tcp_state {
                st.store(Arc::new(forward_state(&rt, name)));
            }
            if let Some(st) = &r.udp_state {
                st.store(Arc::new(udp_forward_state(&rt, name)));
            }
        }
    }

    pub async fn shutdown_all(&self) {
        let mut running = self.running.lock().await;
        for (_name, r) in running.drain() {
            let _ = r.stop.send(true);
            r.task.abort();
        }
    }

    pub async fn reconcile(&self) {
        let snaps = self.registry.snapshot_services().await;

        // Latest registration per service name decides exposure.
        let mut latest: HashMap<String, (u64, bool, Desired)> = HashMap::new();
        for s in snaps {
            let name = s.service.name.clone();
            if name.is_empty() {
                continue;
            }
            let exposed = !s.service.route_only && !s.service.remote_addr.is_empty();
            let want = Desired {
                proto: s.service.proto.clone(),
                addr: s.service.remote_addr.clone(),
            };
            match latest.get(&name) {
                Some((seq, _, _)) if *seq >= s.registered_seq => {}
                _ => {
                    latest.insert(name, (s.registered_seq, exposed, want));
                }
            }
        }

        let desired: HashMap<String, Desired> = latest
            .into_iter()
            .filter_map(|(name, (_seq, exposed, want))| exposed.then_some((name, want)))
            .collect();

        let mut running = self.running.lock().await;

        // Stop removed or changed listeners.
        let names: Vec<String> = running.keys().cloned().collect();
        for name in names {
            let keep = desired
                .get(&name)
                .is_some_and(|want| running.get(&name).is_some_and(|r| &r.desired == want));
            if !keep {
                if let Some(old) = running.remove(&name) {
                    let _ = old.stop.send(true);
                    old.task.abort();
                    tracing::info!(service = %name, "tunnel: stopped auto-listener");
                }
            }
        }

        // Start new ones.
        for (name, want) in desired {
            if running.contains_key(&name) {
                continue;
            }

            let (stop_tx, stop_rx) = watch::channel(false);
            let rt = self.runtime.load();

            let (task, tcp_state, udp_state) = match want.proto.as_str() {
                "udp" => {
                    let state = Arc::new(ArcSwap::from_pointee(udp_forward_state(&rt, &name)));
                    let addr = want.addr.clone();
                    let svc = name.clone();
                    let st = state.clone();
                    let task = tokio::spawn(async move {
                        if let Err(err) = proxy::serve_udp(&addr, st, None, stop_rx).await {
                            tracing::warn!(service = %svc, err = %err, "tunnel: auto-listener udp stopped");
                        }
                    });
                    (task, None, Some(state))
                }
                _ => {
                    let state = Arc::new(ArcSwap::from_pointee(forward_state(&rt, &name)));
                    let addr = want.addr.clone();
                    let svc = name.clone();
                    let st = state.clone();
                    let task = tokio::spawn(async move {
                        if let Err(err) =
                            proxy::serve_tcp(&addr, proxy::TcpHandler::Forward(st), None, stop_rx)
                                .await
                        {
                            tracing::warn!(service = %svc, err = %err, "tunnel: auto-listener tcp stopped");
                        }
                    });
                    (task, Some(state), None)
                }
            };

            tracing::info!(service = %name, proto = %want.proto, addr = %want.addr, "tunnel: auto-listener started");
            running.insert(
                name,
                Running {
                    desired: want,
                    stop: stop_tx,
                    task,
                    tcp_state,
                    udp_state,
                },
            );
        }
    }

    #[cfg(test)]
    pub(crate) async fn running_len(&self) -> usize {
        self.running.lock().await.len()
    }
}

fn forward_state(rt: &AutoListenRuntime, service: &str) -> proxy::ForwardState {
    proxy::ForwardState {
        upstream: format!("tunnel:{service}"),
        dialer: rt.dialer.clone(),
        bridge: rt.bridge.clone(),
        limits: rt.limits.clone(),
        metrics: rt.metrics.clone(),
        sessions: rt.sessions.clone(),
    }
}

fn udp_forward_state(rt: &AutoListenRuntime, service: &str) -> proxy::UdpForwardState {
    proxy::UdpForwardState {
        upstream: format!("tunnel:{service}"),
        dialer: rt.dialer.clone(),
        idle_timeout: rt.limits.idle_timeout,
        metrics: rt.metrics.clone(),
        sessions: rt.sessions.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::prism::tunnel::protocol::RegisteredService;
    use crate::prism::tunnel::registry::testutil::PipeSession;

    fn runtime(reg: &Arc<Registry>) -> Arc<ArcSwap<AutoListenRuntime>> {
        Arc::new(ArcSwap::from_pointee(AutoListenRuntime {
            dialer: dialer::Dialer::new(Duration::from_secs(1), Some(reg.clone())),
            bridge: Arc::new(bridge::Bridge::new(16 * 1024, false)),
            limits: proxy::Limits::default(),
            metrics: Arc::new(telemetry::MetricsCollector::new()),
            sessions: Arc::new(telemetry::SessionRegistry::new()),
        }))
    }

    fn svc(name: &str, route_only: bool, remote_addr: &str) -> RegisteredService {
        RegisteredService {
            name: name.into(),
            proto: "tcp".into(),
            local_addr: "127.0.0.1:25565".into(),
            route_only,
            remote_addr: remote_addr.into(),
        }
    }

    #[tokio::test]
    async fn route_only_never_materializes_a_listener() {
        let reg = Arc::new(Registry::new());
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("game", true, "127.0.0.1:0")])
            .await
            .unwrap();

        let al = AutoListener::new(reg.clone(), runtime(&reg));
        al.reconcile().await;
        assert_eq!(al.running_len().await, 0);
        al.shutdown_all().await;
    }

    #[tokio::test]
    async fn remote_addr_opens_and_toggle_closes() {
        let reg = Arc::new(Registry::new());
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("game", false, "127.0.0.1:0")])
            .await
            .unwrap();

        let al = AutoListener::new(reg.clone(), runtime(&reg));
        al.reconcile().await;
        assert_eq!(al.running_len().await, 1);

        // Same client re-registers the service as route-only; one reconcile
        // later the listener is gone.
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("game", true, "127.0.0.1:0")])
            .await
            .unwrap();
        al.reconcile().await;
        assert_eq!(al.running_len().await, 0);

        al.shutdown_all().await;
    }

    #[tokio::test]
    async fn changed_addr_restarts_listener() {
        let reg = Arc::new(Registry::new());
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("game", false, "127.0.0.1:0")])
            .await
            .unwrap();

        let al = AutoListener::new(reg.clone(), runtime(&reg));
        al.reconcile().await;
        assert_eq!(al.running_len().await, 1);

        reg.register_client("c-2".into(), PipeSession::new(), vec![svc("game", false, "127.0.0.2:0")])
            .await
            .unwrap();
        al.reconcile().await;
        // Latest registration wins; still exactly one listener.
        assert_eq!(al.running_len().await, 1);
        let running = al.running.lock().await;
        assert_eq!(running.get("game").unwrap().desired.addr, "127.0.0.2:0");
        drop(running);

        al.shutdown_all().await;
    }
}
