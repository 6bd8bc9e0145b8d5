use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
    },
    time::SystemTime,
};

use dashmap::DashMap;
use serde::Serialize;

/// Process-wide connection counters plus per-host route hits.
///
/// Everything here is lock-free; the snapshot is the admin surface's contract.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    active: AtomicI64,
    total: AtomicU64,
    bytes_ingress: AtomicU64,
    bytes_egress: AtomicU64,
    route_hits: DashMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: i64,
    pub total_connections: u64,
    pub bytes_ingress: u64,
    pub bytes_egress: u64,
    pub route_hits: HashMap<String, u64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection for as long as the returned guard lives.
    pub fn track_conn(self: &Arc<Self>) -> ActiveConnGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        ActiveConnGuard {
            metrics: self.clone(),
        }
    }

    pub fn add_bytes(&self, ingress: u64, egress: u64) {
        self.bytes_ingress.fetch_add(ingress, Ordering::Relaxed);
        self.bytes_egress.fetch_add(egress, Ordering::Relaxed);
    }

    pub fn route_hit(&self, host: &str) {
        match host.trim() {
            "" => {}
            h => *self.route_hits.entry(h.to_ascii_lowercase()).or_default() += 1,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active.load(Ordering::Relaxed),
            total_connections: self.total.load(Ordering::Relaxed),
            bytes_ingress: self.bytes_ingress.load(Ordering::Relaxed),
            bytes_egress: self.bytes_egress.load(Ordering::Relaxed),
            route_hits: self
                .route_hits
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

/// Holds the active-connection count up while alive.
pub struct ActiveConnGuard {
    metrics: SharedMetrics,
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub client: String,
    pub host: String,
    pub upstream: String,
    pub started_at_unix_ms: u64,
}

/// Live sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, s: SessionInfo) {
        self.sessions.insert(s.id.clone(), s);
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.sessions.iter().map(|e| e.value().clone()).collect();
        out.sort_unstable_by_key(|s| s.started_at_unix_ms);
        out
    }
}

/// Counts live listener loops; `health()` is "at least one listener is up".
#[derive(Debug, Default)]
pub struct ListenerTracker {
    live: AtomicUsize,
}

impl ListenerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_up(self: &Arc<Self>) -> ListenerGuard {
        self.live.fetch_add(1, Ordering::Relaxed);
        ListenerGuard {
            tracker: self.clone(),
        }
    }

    pub fn healthy(&self) -> bool {
        self.live.load(Ordering::Relaxed) > 0
    }
}

pub struct ListenerGuard {
    tracker: Arc<ListenerTracker>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.tracker.live.fetch_sub(1, Ordering::Relaxed);
    }
}

pub fn now_unix_ms() -> u64 {
    // Elapsed-since-epoch; a clock before 1970 degrades to zero.
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map_or(0, |d| d.as_millis() as u64)
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(0);

/// Process-wide monotonic session ids; uniqueness across restarts is not needed.
pub fn new_session_id() -> String {
    format!("s{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed) + 1)
}

pub type SharedMetrics = Arc<MetricsCollector>;
pub type SharedSessions = Arc<SessionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_guard_tracks_active_and_total() {
        let m = Arc::new(MetricsCollector::new());
        let g = m.track_conn();
        assert_eq!(m.snapshot().active_connections, 1);
        drop(g);
        let snap = m.snapshot();
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.total_connections, 1);
    }

    #[test]
    fn route_hits_normalize_and_accumulate() {
        let m = MetricsCollector::new();
        m.add_bytes(10, 20);
        m.route_hit("Play.Example.Com");
        m.route_hit(" play.example.com ");
        m.route_hit("   ");
        let snap = m.snapshot();
        assert_eq!(snap.bytes_ingress, 10);
        assert_eq!(snap.bytes_egress, 20);
        assert_eq!(snap.route_hits.len(), 1);
        assert_eq!(snap.route_hits.get("play.example.com"), Some(&2));
    }

    #[test]
    fn session_snapshot_sorted_by_start() {
        let r = SessionRegistry::new();
        r.add(SessionInfo {
            id: "b".into(),
            client: "c2".into(),
            host: "".into(),
            upstream: "".into(),
            started_at_unix_ms: 2,
        });
        r.add(SessionInfo {
            id: "a".into(),
            client: "c1".into(),
            host: "".into(),
            upstream: "".into(),
            started_at_unix_ms: 1,
        });
        let snap = r.snapshot();
        assert_eq!(snap[0].id, "a");
        r.remove("a");
        assert_eq!(r.snapshot().len(), 1);
    }

    #[test]
    fn listener_tracker_health() {
        let t = Arc::new(ListenerTracker::new());
        assert!(!t.healthy());
        let g = t.listener_up();
        assert!(t.healthy());
        drop(g);
        assert!(!t.healthy());
    }
}
