use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::{Mutex, watch};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct StatusKey {
    pub upstream: String,
    pub protocol_version: i32,
}

#[derive(Debug, Clone)]
struct Entry {
    expires_at: Instant,
    data: Bytes,
}

#[derive(Debug)]
struct InFlight {
    done: watch::Sender<bool>,
    // Failed loads are shared with concurrent waiters but never cached.
    result: Mutex<Option<Result<Bytes, String>>>,
}

impl InFlight {
    fn new() -> Self {
        let (done, _rx) = watch::channel(false);
        Self {
            done,
            result: Mutex::new(None),
        }
    }
}

/// Cache of raw status-response frames keyed by upstream and protocol
/// version, with lazy expiration and singleflight loads.
#[derive(Debug, Default)]
pub struct StatusCache {
    entries: Mutex<HashMap<StatusKey, Entry>>,
    inflight: Mutex<HashMap<StatusKey, Arc<InFlight>>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &StatusKey) -> Option<Bytes> {
        let mut entries = self.entries.lock().await;
        let e = entries.get(key)?.clone();
        if Instant::now() >= e.expires_at || e.data.is_empty() {
            entries.remove(key);
            return None;
        }
        Some(e.data)
    }

    async fn set(&self, key: StatusKey, data: Bytes, ttl: Duration) {
        if ttl.is_zero() || data.is_empty() {
            return;
        }
        self.entries.lock().await.insert(
            key,
            Entry {
                expires_at: Instant::now() + ttl,
                data,
            },
        );
    }

    /// Return the cached frame or load it exactly once per key, with all
    /// concurrent callers sharing the loader's outcome.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: StatusKey,
        ttl: Duration,
        load: F,
    ) -> anyhow::Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<Vec<u8>>> + Send,
    {
        if ttl.is_zero() {
            return Ok(Bytes::from(load().await?));
        }
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }

        let (flight, leader) = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let f = Arc::new(InFlight::new());
                    inflight.insert(key.clone(), f.clone());
                    (f, true)
                }
            }
        };

        if !leader {
            let mut done = flight.done.subscribe();
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            let shared = flight
                .result
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| Err("status cache: missing inflight result".into()));
            return shared.map_err(|e| anyhow::anyhow!(e));
        }

        let out = match load().await {
            Ok(v) => {
                let data = Bytes::from(v);
                self.set(key.clone(), data.clone(), ttl).await;
                Ok(data)
            }
            Err(err) => Err(err),
        };

        {
            let mut slot = flight.result.lock().await;
            *slot = Some(out.as_ref().map(Bytes::clone).map_err(|e| e.to_string()));
        }
        let _ = flight.done.send(true);
        self.inflight.lock().await.remove(&key);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(upstream: &str) -> StatusKey {
        StatusKey {
            upstream: upstream.into(),
            protocol_version: 763,
        }
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let c = StatusCache::new();
        let loads = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let loads = loads.clone();
            let got = c
                .get_or_load(key("a:1"), Duration::from_secs(5), move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(b"frame".to_vec())
                })
                .await
                .unwrap();
            assert_eq!(&got[..], b"frame");
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_reloads() {
        let c = StatusCache::new();
        c.get_or_load(key("a:1"), Duration::from_millis(10), || async {
            Ok(b"one".to_vec())
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(c.get(&key("a:1")).await.is_none());
    }

    #[tokio::test]
    async fn failed_load_is_not_cached() {
        let c = StatusCache::new();
        let res = c
            .get_or_load(key("a:1"), Duration::from_secs(5), || async {
                anyhow::bail!("backend down")
            })
            .await;
        assert!(res.is_err());

        let got = c
            .get_or_load(key("a:1"), Duration::from_secs(5), || async {
                Ok(b"up".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(&got[..], b"up");
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_flight() {
        let c = Arc::new(StatusCache::new());
        let loads = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            let loads = loads.clone();
            tasks.push(tokio::spawn(async move {
                c.get_or_load(key("a:1"), Duration::from_secs(5), move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(b"frame".to_vec())
                })
                .await
                .unwrap()
            }));
        }
        for t in tasks {
            assert_eq!(&t.await.unwrap()[..], b"frame");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
