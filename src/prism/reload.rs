use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::prism::config::{self, Config};

type Subscriber = Box<dyn Fn(&Arc<Config>, &Arc<Config>) + Send + Sync>;

/// Owns the active config snapshot.
///
/// The initial load failing fails the process; a reload failing keeps the
/// previous snapshot. On success the snapshot is swapped atomically and
/// subscribers run serially with `(old, new)`. The poll loop compares
/// `(mtime, size)` of the source file.
pub struct ConfigManager {
    path: PathBuf,
    current: ArcSwap<Config>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ConfigManager {
    /// Perform the initial load.
    pub fn load_initial(path: PathBuf) -> anyhow::Result<Self> {
        let cfg = config::load_config(&path)
            .with_context(|| format!("load config {}", path.display()))?;
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(cfg),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Subscribers must not block; they run on the reloading task.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Arc<Config>, &Arc<Config>) + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Box::new(f));
    }

    /// Load, swap and notify. The previous snapshot stays active on error.
    pub fn reload_now(&self) -> anyhow::Result<Arc<Config>> {
        let cfg = config::load_config(&self.path)
            .with_context(|| format!("reload config {}", self.path.display()))?;
        let new = Arc::new(cfg);
        let old = self.current.swap(new.clone());

        let subs = self.subscribers.lock().unwrap();
        for s in subs.iter() {
            s(&old, &new);
        }
        tracing::info!(path = %self.path.display(), "reload: applied");
        Ok(new)
    }

    /// Poll the source file until shutdown. Admin-triggered reloads go
    /// through `reload_now` directly.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut last_sig = file_sig(&self.path).ok();

        loop {
            let (enabled, poll) = {
                let cur = self.current.load();
                (cur.reload.enabled, cur.reload.poll_interval)
            };
            let sleep_for = if enabled {
                poll.max(Duration::from_millis(200))
            } else {
                Duration::from_secs(3600)
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {
                    if !enabled {
                        continue;
                    }
                    let sig = match file_sig(&self.path) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    if last_sig == Some(sig) {
                        continue;
                    }
                    if let Err(err) = self.reload_now() {
                        tracing::warn!(err = %err, "reload: config load failed; keeping previous snapshot");
                    }
                    last_sig = Some(sig);
                }
            }
        }
    }
}

fn file_sig(path: &Path) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let mtime_ms = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((mtime_ms, meta.len()))
}
