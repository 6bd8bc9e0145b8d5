use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::RwLock;

use crate::prism::tunnel::{
    protocol::{self, ProxyStreamKind, RegisteredService},
    transport::{BoxedStream, TransportSession},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service not found")]
    ServiceNotFound,
    #[error("tunnel stream open failed: {0}")]
    StreamOpen(String),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceSnapshot {
    pub service: RegisteredService,
    pub client_id: String,
    pub remote: String,
    pub primary: bool,
    /// Monotonic registration sequence of the owning client.
    pub registered_seq: u64,
}

struct ClientEntry {
    sess: Arc<dyn TransportSession>,
    services: HashMap<String, RegisteredService>,
    remote: String,
    /// Registration order; drives FIFO primary promotion.
    seq: u64,
}

#[derive(Default)]
struct State {
    clients: HashMap<String, ClientEntry>,
    /// Per service name: client ids in registration order. The head after
    /// filtering to live clients is the primary.
    providers: HashMap<String, Vec<String>>,
    primary: HashMap<String, String>,
}

/// In-memory tunnel service registry.
///
/// First registrant of a name stays primary; on primary disconnect the oldest
/// remaining registrant is promoted. Later registrants never steal an
/// existing primary. Subscribers are notified (fire-and-forget) of any change.
pub struct Registry {
    id_seq: AtomicU64,
    reg_seq: AtomicU64,
    state: RwLock<State>,
    changed: tokio::sync::watch::Sender<u64>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (tx, _rx) = tokio::sync::watch::channel(0u64);
        Self {
            id_seq: AtomicU64::new(1),
            reg_seq: AtomicU64::new(1),
            state: RwLock::new(State::default()),
            changed: tx,
        }
    }

    /// Watch for registry changes; the value is an opaque change counter.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
        self.changed.subscribe()
    }

    pub fn next_client_id(&self) -> String {
        format!("c-{}", self.id_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn register_client(
        &self,
        id: String,
        sess: Arc<dyn TransportSession>,
        services: Vec<RegisteredService>,
    ) -> anyhow::Result<()> {
        let id = id.trim().to_string();
        if id.is_empty() {
            anyhow::bail!("tunnel: empty client id");
        }

        let mut entry = ClientEntry {
            remote: sess
                .remote_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            sess,
            services: HashMap::new(),
            seq: self.reg_seq.fetch_add(1, Ordering::Relaxed),
        };
        for s in services {
            if let Some(ns) = s.normalize() {
                entry.services.insert(ns.name.clone(), ns);
            }
        }

        let mut st = self.state.write().await;

        // A client re-registering under the same id displaces its old entry.
        if let Some(old) = remove_client_locked(&mut st, &id) {
            old.sess.close().await;
        }

        for name in entry.services.keys() {
            st.providers.entry(name.clone()).or_default().push(id.clone());
            st.primary.entry(name.clone()).or_insert_with(|| id.clone());
        }
        st.clients.insert(id, entry);
        drop(st);

        self.bump();
        Ok(())
    }

    pub async fn unregister_client(&self, id: &str) {
        let id = id.trim();
        if id.is_empty() {
            return;
        }

        let old = {
            let mut st = self.state.write().await;
            remove_client_locked(&mut st, id)
        };
        let Some(old) = old else {
            return;
        };
        old.sess.close().await;
        self.bump();
    }

    pub async fn has_service(&self, name: &str) -> bool {
        self.state.read().await.primary.contains_key(name.trim())
    }

    /// Open a proxy stream to the primary registrant of `name` (TCP kind).
    pub async fn dial_service(&self, name: &str) -> Result<BoxedStream, RegistryError> {
        self.dial(name, ProxyStreamKind::Tcp).await
    }

    /// Open a datagram-carrying proxy stream to the primary registrant.
    pub async fn dial_service_udp(&self, name: &str) -> Result<BoxedStream, RegistryError> {
        self.dial(name, ProxyStreamKind::Udp).await
    }

    async fn dial(&self, name: &str, kind: ProxyStreamKind) -> Result<BoxedStream, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::ServiceNotFound);
        }

        let sess: Arc<dyn TransportSession> = {
            let st = self.state.read().await;
            let cid = st
                .primary
                .get(name)
                .ok_or(RegistryError::ServiceNotFound)?;
            let entry = st.clients.get(cid).ok_or(RegistryError::ServiceNotFound)?;
            if !entry.services.contains_key(name) {
                return Err(RegistryError::ServiceNotFound);
            }
            entry.sess.clone()
        };

        let mut stream = sess
            .open_stream()
            .await
            .map_err(|e| RegistryError::StreamOpen(e.to_string()))?;
        protocol::write_proxy_stream_header(&mut stream, kind, name)
            .await
            .map_err(|e| RegistryError::StreamOpen(e.to_string()))?;
        Ok(stream)
    }

    /// All registrations across all clients, for reconciliation and the admin
    /// surface.
    pub async fn snapshot_services(&self) -> Vec<ServiceSnapshot> {
        let st = self.state.read().await;
        let mut out = Vec::new();
        for (cid, entry) in &st.clients {
            for (name, svc) in &entry.services {
                out.push(ServiceSnapshot {
                    service: svc.clone(),
                    client_id: cid.clone(),
                    remote: entry.remote.clone(),
                    primary: st.primary.get(name).is_some_and(|p| p == cid),
                    registered_seq: entry.seq,
                });
            }
        }
        out
    }

    fn bump(&self) {
        let prev = *self.changed.borrow();
        let _ = self.changed.send(prev.wrapping_add(1));
    }
}

/// Remove a client from every index; re-elect primaries it held (FIFO among
/// the remaining registrants of each affected service).
fn remove_client_locked(st: &mut State, id: &str) -> Option<ClientEntry> {
    let old = st.clients.remove(id)?;

    for name in old.services.keys() {
        if let Some(list) = st.providers.get_mut(name) {
            list.retain(|cid| cid != id);
            if list.is_empty() {
                st.providers.remove(name);
            }
        }

        if st.primary.get(name).is_some_and(|p| p == id) {
            st.primary.remove(name);
            if let Some(list) = st.providers.get(name) {
                if let Some(next) = list.first() {
                    st.primary.insert(name.clone(), next.clone());
                }
            }
        }
    }

    Some(old)
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use crate::prism::tunnel::transport::{BoxedStream, TransportSession};

    /// Session whose `open_stream` returns one end of a fresh duplex pipe and
    /// parks the peer end for the test to inspect.
    pub struct PipeSession {
        pub peers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl PipeSession {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                peers: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl TransportSession for PipeSession {
        async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
            let (near, far) = tokio::io::duplex(64 * 1024);
            self.peers.lock().await.push(far);
            Ok(Box::new(near))
        }

        async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
            anyhow::bail!("not supported")
        }

        async fn close(&self) {}

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::PipeSession;
    use super::*;
    use tokio::io::AsyncReadExt;

    fn svc(name: &str) -> RegisteredService {
        RegisteredService {
            name: name.into(),
            proto: "tcp".into(),
            local_addr: "127.0.0.1:1".into(),
            route_only: false,
            remote_addr: "".into(),
        }
    }

    #[tokio::test]
    async fn first_registrant_stays_primary() {
        let reg = Registry::new();
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("game")])
            .await
            .unwrap();
        reg.register_client("c-2".into(), PipeSession::new(), vec![svc("game")])
            .await
            .unwrap();

        let snaps = reg.snapshot_services().await;
        let primary: Vec<_> = snaps.iter().filter(|s| s.primary).collect();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].client_id, "c-1");
    }

    #[tokio::test]
    async fn fifo_promotion_on_primary_loss() {
        let reg = Registry::new();
        for id in ["c-1", "c-2", "c-3"] {
            reg.register_client(id.into(), PipeSession::new(), vec![svc("game")])
                .await
                .unwrap();
        }

        reg.unregister_client("c-1").await;
        let snaps = reg.snapshot_services().await;
        let primary: Vec<_> = snaps.iter().filter(|s| s.primary).collect();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].client_id, "c-2");

        reg.unregister_client("c-2").await;
        let snaps = reg.snapshot_services().await;
        assert_eq!(
            snaps.iter().find(|s| s.primary).map(|s| s.client_id.clone()),
            Some("c-3".to_string())
        );

        reg.unregister_client("c-3").await;
        assert!(!reg.has_service("game").await);
    }

    #[tokio::test]
    async fn non_primary_disconnect_keeps_primary() {
        let reg = Registry::new();
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("game")])
            .await
            .unwrap();
        reg.register_client("c-2".into(), PipeSession::new(), vec![svc("game")])
            .await
            .unwrap();

        reg.unregister_client("c-2").await;
        let snaps = reg.snapshot_services().await;
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].primary);
        assert_eq!(snaps[0].client_id, "c-1");
    }

    #[tokio::test]
    async fn same_id_reregistration_displaces_old_entry() {
        let reg = Registry::new();
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("a")])
            .await
            .unwrap();
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("b")])
            .await
            .unwrap();

        assert!(!reg.has_service("a").await);
        assert!(reg.has_service("b").await);
        let snaps = reg.snapshot_services().await;
        assert_eq!(snaps.len(), 1);
    }

    #[tokio::test]
    async fn dial_writes_proxy_header_on_primary_session() {
        let reg = Registry::new();
        let sess = PipeSession::new();
        reg.register_client("c-1".into(), sess.clone(), vec![svc("game")])
            .await
            .unwrap();

        let _stream = reg.dial_service("game").await.unwrap();

        let mut peers = sess.peers.lock().await;
        let peer = peers.first_mut().expect("one opened stream");
        let mut magic = [0u8; 4];
        peer.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"PRPX");

        assert!(matches!(
            reg.dial_service("missing").await,
            Err(RegistryError::ServiceNotFound)
        ));
    }

    #[tokio::test]
    async fn subscriber_sees_changes() {
        let reg = Registry::new();
        let mut sub = reg.subscribe();
        let before = *sub.borrow();
        reg.register_client("c-1".into(), PipeSession::new(), vec![svc("game")])
            .await
            .unwrap();
        sub.changed().await.unwrap();
        assert_ne!(*sub.borrow(), before);
    }
}
