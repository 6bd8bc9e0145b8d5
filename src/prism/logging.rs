use std::{
    io,
    path::Path,
    sync::{Arc, Mutex, OnceLock},
};

use anyhow::Context;
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::prism::config;

static GLOBAL_LOG_TAIL: OnceLock<Arc<LogTail>> = OnceLock::new();

/// Bounded in-memory tail of formatted log lines for the admin surface.
///
/// A fixed-capacity ring: once full, each new line overwrites the oldest slot
/// and bumps the eviction counter reported as `dropped`.
#[derive(Debug)]
pub struct LogTail {
    ring: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<String>,
    cap: usize,
    /// Total lines ever recorded; `written % cap` is the next slot to fill.
    written: u64,
    evicted: u64,
}

#[derive(Debug, Serialize)]
pub struct LogSnapshot {
    pub lines: Vec<String>,
    pub dropped: u64,
}

impl LogTail {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: Vec::with_capacity(cap),
                cap,
                written: 0,
                evicted: 0,
            }),
        }
    }

    pub fn record(&self, line: String) {
        let mut g = self.ring.lock().unwrap();
        let at = (g.written % g.cap as u64) as usize;
        if at < g.slots.len() {
            g.slots[at] = line;
            g.evicted += 1;
        } else {
            g.slots.push(line);
        }
        g.written += 1;
    }

    /// The most recent `limit` lines, oldest first.
    pub fn snapshot(&self, limit: usize) -> LogSnapshot {
        let g = self.ring.lock().unwrap();
        let take = limit.min(g.slots.len()) as u64;
        let lines = (0..take)
            .map(|off| {
                let nth = g.written - take + off;
                g.slots[(nth % g.cap as u64) as usize].clone()
            })
            .collect();
        LogSnapshot {
            lines,
            dropped: g.evicted,
        }
    }
}

pub fn log_tail() -> Option<Arc<LogTail>> {
    GLOBAL_LOG_TAIL.get().cloned()
}

#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

pub fn init(cfg: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let fmt = cfg.format.trim().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&cfg.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(cfg.output.trim())?;

    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text")
        .with_target(true);
    let base = if fmt == "json" {
        base.json().boxed()
    } else {
        base.boxed()
    };

    let tail_layer = if cfg.buffer_lines > 0 {
        let tail = Arc::new(LogTail::new(cfg.buffer_lines));
        let _ = GLOBAL_LOG_TAIL.set(tail.clone());
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(TailMakeWriter { tail })
                .with_ansi(false)
                .with_target(true)
                .json(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base)
        .with(tail_layer)
        .init();

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(
    output: &str,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    Ok(match output {
        "" | "stderr" => tracing_appender::non_blocking(io::stderr()),
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "discard" => tracing_appender::non_blocking(io::sink()),
        path => tracing_appender::non_blocking(open_append(Path::new(path))?),
    })
}

fn open_append(p: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(dir) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("logging: mkdir {}", dir.display()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(p)
        .with_context(|| format!("logging: open {}", p.display()))
}

#[derive(Clone)]
struct TailMakeWriter {
    tail: Arc<LogTail>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for TailMakeWriter {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter {
            tail: self.tail.clone(),
            bytes: Vec::with_capacity(256),
        }
    }
}

/// One writer per formatted event: bytes accumulate and are committed to the
/// tail as lines when the fmt layer drops the writer.
struct EventWriter {
    tail: Arc<LogTail>,
    bytes: Vec<u8>,
}

impl io::Write for EventWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        for line in String::from_utf8_lossy(&self.bytes).lines() {
            if !line.is_empty() {
                self.tail.record(line.to_owned());
            }
        }
    }
}
