use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

/// The typed snapshot the core consumes. Immutable after publication; reloads
/// build a fresh one and swap it atomically.
#[derive(Debug, Clone)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
    pub routes: Vec<RouteConfig>,
    pub routing_parsers: Vec<RoutingParserConfig>,
    pub max_header_bytes: usize,
    pub buffer_size: usize,
    pub upstream_dial_timeout: Duration,
    pub timeouts: Timeouts,
    pub proxy_protocol_v2: bool,
    pub reload: ReloadConfig,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub listen_addr: String,
    /// "tcp" or "udp".
    pub protocol: String,
    /// Empty on TCP means routing mode; UDP requires an upstream.
    pub upstream: String,
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub hosts: Vec<String>,
    pub upstreams: Vec<String>,
    pub strategy: String,
    pub cache_ping_ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RoutingParserConfig {
    /// "builtin" or "wasm".
    pub kind: String,
    pub name: String,
    pub path: String,
    pub function: Option<String>,
    pub max_output_len: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    /// Capacity of the admin log tail; 0 disables it.
    pub buffer_lines: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub auth_token: String,
    pub auto_listen_services: bool,
    pub listeners: Vec<TunnelListenerConfig>,
    pub client: Option<TunnelClientConfig>,
    pub services: Vec<TunnelServiceConfig>,
}

#[derive(Debug, Clone)]
pub struct TunnelListenerConfig {
    pub listen_addr: String,
    pub transport: String,
    pub quic: QuicServerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct QuicServerConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    pub server_addr: String,
    pub transport: String,
    pub dial_timeout: Duration,
    pub quic: QuicClientConfig,
}

#[derive(Debug, Clone, Default)]
pub struct QuicClientConfig {
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelServiceConfig {
    pub name: String,
    pub proto: String,
    pub local_addr: String,
    pub route_only: bool,
    pub remote_addr: String,
}

// --- config path resolution ----------------------------------------------

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    // clap already folds PRISM_CONFIG into the flag value.
    if let Some(p) = flag {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        let mut p = p;
        if p.extension().is_none() && !p.is_file() {
            p.set_extension("toml");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    for candidate in ["prism.toml", "prism.yaml", "prism.yml"] {
        let p = PathBuf::from(candidate);
        if p.is_file() {
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Cwd,
            });
        }
    }

    let proj =
        ProjectDirs::from("dev", "prism", "prism").context("config: resolve user config dir")?;
    Ok(ResolvedConfigPath {
        path: proj.config_dir().join("prism.toml"),
        source: ConfigPathSource::Default,
    })
}

/// Create the config file from the embedded template if missing.
/// Returns true when a new file was written.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "toml" => DEFAULT_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_TEMPLATE_YAML,
        other => anyhow::bail!("config: unsupported extension {other:?} (expected toml|yaml|yml)"),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    use std::io::Write;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&text).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&text)
            .with_context(|| format!("parse yaml {}", path.display()))?,
        other => anyhow::bail!("config: unsupported extension {other:?}"),
    };

    Config::from_file(fc)
}

// --- file schema ----------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    listeners: Vec<FileListener>,
    #[serde(default)]
    routes: Option<FileRoutes>,
    #[serde(default)]
    routing_parsers: Vec<FileRoutingParser>,
    #[serde(default)]
    max_header_bytes: Option<i64>,
    #[serde(default)]
    buffer_size: Option<i64>,
    #[serde(default)]
    upstream_dial_timeout_ms: Option<i64>,
    timeouts: Option<FileTimeouts>,
    #[serde(default)]
    proxy_protocol_v2: bool,
    reload: Option<FileReload>,
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    tunnel: Option<FileTunnel>,
}

/// The canonical route encoding is the list form; the legacy
/// map-of-host-to-upstream form is upconverted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileRoutes {
    List(Vec<FileRoute>),
    Map(BTreeMap<String, StringOrVec>),
}

#[derive(Debug, Deserialize)]
struct FileRoute {
    host: Option<StringOrVec>,
    hosts: Option<StringOrVec>,
    upstream: Option<StringOrVec>,
    upstreams: Option<StringOrVec>,
    strategy: Option<String>,
    cache_ping_ttl: Option<String>,
    cache_ping_ttl_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileListener {
    listen_addr: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    upstream: String,
}

#[derive(Debug, Deserialize)]
struct FileRoutingParser {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    path: Option<String>,
    function: Option<String>,
    max_output_len: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    handshake_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileReload {
    #[serde(default = "default_true")]
    enabled: bool,
    poll_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    buffer_lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FileTunnel {
    auth_token: Option<String>,
    auto_listen_services: Option<bool>,
    #[serde(alias = "endpoints")]
    listeners: Option<Vec<FileTunnelListener>>,
    client: Option<FileTunnelClient>,
    services: Option<Vec<FileTunnelService>>,
}

#[derive(Debug, Deserialize)]
struct FileTunnelListener {
    listen_addr: String,
    transport: Option<String>,
    quic: Option<FileQuicServer>,
}

#[derive(Debug, Deserialize)]
struct FileQuicServer {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileTunnelClient {
    server_addr: String,
    transport: Option<String>,
    dial_timeout_ms: Option<i64>,
    quic: Option<FileQuicClient>,
}

#[derive(Debug, Deserialize)]
struct FileQuicClient {
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
}

#[derive(Debug, Deserialize)]
struct FileTunnelService {
    name: String,
    proto: Option<String>,
    local_addr: String,
    #[serde(default)]
    route_only: bool,
    remote_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

fn default_true() -> bool {
    true
}

fn ms(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(n) if n >= 0 => Duration::from_millis(n as u64),
        Some(_) => Duration::from_millis(default_ms),
        None => Duration::from_millis(default_ms),
    }
}

fn parse_cache_ttl(text: Option<&str>, millis: Option<i64>) -> anyhow::Result<Option<Duration>> {
    if let Some(s) = text {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        if s.starts_with('-') {
            return Ok(None);
        }
        let d = humantime::parse_duration(s)?;
        return Ok((!d.is_zero()).then_some(d));
    }
    if let Some(n) = millis {
        if n <= 0 {
            return Ok(None);
        }
        return Ok(Some(Duration::from_millis(n as u64)));
    }
    Ok(None)
}

impl Config {
    fn from_file(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            listeners: Vec::new(),
            routes: Vec::new(),
            routing_parsers: Vec::new(),
            max_header_bytes: fc.max_header_bytes.unwrap_or(0).max(0) as usize,
            buffer_size: fc.buffer_size.unwrap_or(0).max(0) as usize,
            upstream_dial_timeout: ms(fc.upstream_dial_timeout_ms, 5000),
            timeouts: Timeouts {
                handshake_timeout: ms(fc.timeouts.as_ref().and_then(|t| t.handshake_timeout_ms), 3000),
                idle_timeout: ms(fc.timeouts.as_ref().and_then(|t| t.idle_timeout_ms), 0),
            },
            proxy_protocol_v2: fc.proxy_protocol_v2,
            reload: ReloadConfig {
                enabled: fc.reload.as_ref().map(|r| r.enabled).unwrap_or(true),
                poll_interval: ms(fc.reload.as_ref().and_then(|r| r.poll_interval_ms), 1000),
            },
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                buffer_lines: 512,
            },
            tunnel: TunnelConfig {
                auto_listen_services: true,
                ..TunnelConfig::default()
            },
        };

        if cfg.max_header_bytes == 0 {
            cfg.max_header_bytes = 64 * 1024;
        }
        if cfg.buffer_size == 0 {
            cfg.buffer_size = 32 * 1024;
        }
        if cfg.upstream_dial_timeout.is_zero() {
            cfg.upstream_dial_timeout = Duration::from_secs(5);
        }

        for (i, l) in fc.listeners.iter().enumerate() {
            let listen_addr = l.listen_addr.trim().to_string();
            if listen_addr.is_empty() {
                anyhow::bail!("config: listeners[{i}] missing listen_addr");
            }
            let protocol = {
                let p = l.protocol.trim().to_ascii_lowercase();
                if p.is_empty() { "tcp".to_string() } else { p }
            };
            let upstream = l.upstream.trim().to_string();
            match protocol.as_str() {
                "tcp" => {}
                "udp" => {
                    if upstream.is_empty() {
                        anyhow::bail!("config: listeners[{i}] udp requires an upstream");
                    }
                }
                other => anyhow::bail!("config: listeners[{i}] unknown protocol {other:?}"),
            }
            cfg.listeners.push(ListenerConfig {
                listen_addr,
                protocol,
                upstream,
            });
        }

        match fc.routes {
            Some(FileRoutes::List(list)) => {
                for (i, r) in list.into_iter().enumerate() {
                    let mut hosts = Vec::new();
                    if let Some(h) = r.hosts {
                        hosts.extend(h.into_vec());
                    }
                    if let Some(h) = r.host {
                        hosts.extend(h.into_vec());
                    }
                    let hosts: Vec<String> = hosts
                        .into_iter()
                        .map(|s| s.trim().to_ascii_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if hosts.is_empty() {
                        anyhow::bail!("config: routes[{i}] missing hosts");
                    }

                    let mut upstreams = Vec::new();
                    if let Some(u) = r.upstreams {
                        upstreams.extend(u.into_vec());
                    }
                    if let Some(u) = r.upstream {
                        upstreams.extend(u.into_vec());
                    }
                    let upstreams: Vec<String> = upstreams
                        .into_iter()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if upstreams.is_empty() {
                        anyhow::bail!("config: routes[{i}] missing upstreams");
                    }

                    let cache_ping_ttl =
                        parse_cache_ttl(r.cache_ping_ttl.as_deref(), r.cache_ping_ttl_ms)
                            .with_context(|| format!("config: routes[{i}] invalid cache_ping_ttl"))?;

                    cfg.routes.push(RouteConfig {
                        hosts,
                        upstreams,
                        strategy: r.strategy.unwrap_or_default().trim().to_ascii_lowercase(),
                        cache_ping_ttl,
                    });
                }
            }
            Some(FileRoutes::Map(map)) => {
                for (host, upstream) in map {
                    let host = host.trim().to_ascii_lowercase();
                    let upstreams: Vec<String> = upstream
                        .into_vec()
                        .into_iter()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if host.is_empty() || upstreams.is_empty() {
                        anyhow::bail!("config: legacy route {host:?} missing host or upstream");
                    }
                    cfg.routes.push(RouteConfig {
                        hosts: vec![host],
                        upstreams,
                        strategy: String::new(),
                        cache_ping_ttl: None,
                    });
                }
            }
            None => {}
        }

        for (i, rp) in fc.routing_parsers.iter().enumerate() {
            let kind = rp
                .kind
                .clone()
                .unwrap_or_else(|| "builtin".into())
                .trim()
                .to_ascii_lowercase();
            match kind.as_str() {
                "builtin" => {
                    let name = rp.name.clone().unwrap_or_default().trim().to_string();
                    if name.is_empty() {
                        anyhow::bail!("config: routing_parsers[{i}] builtin requires a name");
                    }
                    cfg.routing_parsers.push(RoutingParserConfig {
                        kind,
                        name,
                        path: String::new(),
                        function: None,
                        max_output_len: None,
                    });
                }
                "wasm" => {
                    let path = rp.path.clone().unwrap_or_default().trim().to_string();
                    if path.is_empty() {
                        anyhow::bail!("config: routing_parsers[{i}] wasm requires a path");
                    }
                    cfg.routing_parsers.push(RoutingParserConfig {
                        kind,
                        name: rp.name.clone().unwrap_or_default().trim().to_string(),
                        path,
                        function: rp
                            .function
                            .clone()
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty()),
                        max_output_len: rp.max_output_len,
                    });
                }
                other => anyhow::bail!(
                    "config: routing_parsers[{i}] unknown type {other:?} (expected builtin|wasm)"
                ),
            }
        }

        if let Some(l) = &fc.logging {
            if let Some(v) = &l.level {
                if !v.trim().is_empty() {
                    cfg.logging.level = v.trim().to_string();
                }
            }
            if let Some(v) = &l.format {
                if !v.trim().is_empty() {
                    cfg.logging.format = v.trim().to_string();
                }
            }
            if let Some(v) = &l.output {
                if !v.trim().is_empty() {
                    cfg.logging.output = v.trim().to_string();
                }
            }
            if let Some(v) = l.buffer_lines {
                cfg.logging.buffer_lines = v;
            }
        }

        if let Some(t) = fc.tunnel {
            cfg.tunnel.auth_token = t.auth_token.unwrap_or_default().trim().to_string();
            cfg.tunnel.auto_listen_services = t.auto_listen_services.unwrap_or(true);

            for tl in t.listeners.unwrap_or_default() {
                cfg.tunnel.listeners.push(TunnelListenerConfig {
                    listen_addr: tl.listen_addr.trim().to_string(),
                    transport: tl
                        .transport
                        .unwrap_or_else(|| "tcp".into())
                        .trim()
                        .to_ascii_lowercase(),
                    quic: QuicServerConfig {
                        cert_file: tl
                            .quic
                            .as_ref()
                            .and_then(|q| q.cert_file.clone())
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                        key_file: tl
                            .quic
                            .as_ref()
                            .and_then(|q| q.key_file.clone())
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                    },
                });
            }

            if let Some(c) = t.client {
                cfg.tunnel.client = Some(TunnelClientConfig {
                    server_addr: c.server_addr.trim().to_string(),
                    transport: c
                        .transport
                        .unwrap_or_else(|| "tcp".into())
                        .trim()
                        .to_ascii_lowercase(),
                    dial_timeout: ms(c.dial_timeout_ms, 5000),
                    quic: QuicClientConfig {
                        server_name: c
                            .quic
                            .as_ref()
                            .and_then(|q| q.server_name.clone())
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                        insecure_skip_verify: c
                            .quic
                            .as_ref()
                            .map(|q| q.insecure_skip_verify)
                            .unwrap_or(false),
                    },
                });
            }

            for s in t.services.unwrap_or_default() {
                let route_only = s.route_only;
                let mut remote_addr = s.remote_addr.unwrap_or_default().trim().to_string();
                if route_only {
                    remote_addr.clear();
                }
                cfg.tunnel.services.push(TunnelServiceConfig {
                    name: s.name.trim().to_string(),
                    proto: {
                        let p = s.proto.unwrap_or_default().trim().to_ascii_lowercase();
                        if p.is_empty() { "tcp".into() } else { p }
                    },
                    local_addr: s.local_addr.trim().to_string(),
                    route_only,
                    remote_addr,
                });
            }
        }

        Ok(cfg)
    }
}

const DEFAULT_TEMPLATE_TOML: &str = r#"# Prism configuration (auto-generated)
#
# This default config is runnable without edits: Prism starts a tunnel
# gateway and waits for clients to connect and register services. To expose a
# registered service publicly, give it a remote_addr (for example ":25565");
# Prism then listens on that port automatically.

admin_addr = ":8080"

[tunnel]
auth_token = ""
auto_listen_services = true

[[tunnel.listeners]]
listen_addr = ":7000"
transport = "tcp" # tcp | udp | quic

[logging]
level = "info"
format = "json"
output = "stderr"

[reload]
enabled = true
poll_interval_ms = 1000

[timeouts]
handshake_timeout_ms = 3000
idle_timeout_ms = 0
"#;

const DEFAULT_TEMPLATE_YAML: &str = r#"# Prism configuration (auto-generated)
#
# This default config is runnable without edits: Prism starts a tunnel
# gateway and waits for clients to connect and register services. To expose a
# registered service publicly, give it a remote_addr (for example ":25565");
# Prism then listens on that port automatically.

admin_addr: ":8080"

tunnel:
  auth_token: ""
  auto_listen_services: true
  listeners:
    - listen_addr: ":7000"
      transport: "tcp" # tcp | udp | quic

logging:
  level: "info"
  format: "json"
  output: "stderr"

reload:
  enabled: true
  poll_interval_ms: 1000

timeouts:
  handshake_timeout_ms: 3000
  idle_timeout_ms: 0
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, ext: &str, contents: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("prism_cfg_{name}_{}_{nanos}.{ext}", std::process::id()));
        fs::write(&p, contents).expect("write temp config");
        p
    }

    #[test]
    fn toml_list_routes_and_defaults() {
        let p = write_temp(
            "list",
            "toml",
            r#"
admin_addr = ":8080"

[[listeners]]
listen_addr = ":25565"

[[routes]]
hosts = ["play.example.com", "*.example.net"]
upstreams = ["10.0.0.1:25565", "10.0.0.2:25565"]
strategy = "round-robin"
cache_ping_ttl = "10s"

[tunnel]
auth_token = "t"

[[tunnel.endpoints]]
listen_addr = ":7000"
"#,
        );

        let cfg = load_config(&p).unwrap();
        assert_eq!(cfg.listeners.len(), 1);
        assert_eq!(cfg.listeners[0].protocol, "tcp");
        assert!(cfg.listeners[0].upstream.is_empty());

        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.routes[0].hosts, vec!["play.example.com", "*.example.net"]);
        assert_eq!(cfg.routes[0].strategy, "round-robin");
        assert_eq!(cfg.routes[0].cache_ping_ttl, Some(Duration::from_secs(10)));

        assert_eq!(cfg.max_header_bytes, 64 * 1024);
        assert_eq!(cfg.buffer_size, 32 * 1024);
        assert_eq!(cfg.upstream_dial_timeout, Duration::from_secs(5));
        assert_eq!(cfg.timeouts.handshake_timeout, Duration::from_secs(3));
        assert!(cfg.reload.enabled);

        // "endpoints" is accepted as an alias for tunnel.listeners.
        assert_eq!(cfg.tunnel.listeners.len(), 1);
        assert_eq!(cfg.tunnel.listeners[0].transport, "tcp");

        let _ = fs::remove_file(&p);
    }

    #[test]
    fn legacy_map_routes_upconvert() {
        let p = write_temp(
            "map",
            "toml",
            r#"
[routes]
"Play.Example.Com" = "10.0.0.1:25565"
"other.example.com" = ["10.0.0.2:25565", "10.0.0.3:25565"]
"#,
        );

        let cfg = load_config(&p).unwrap();
        assert_eq!(cfg.routes.len(), 2);
        let play = cfg
            .routes
            .iter()
            .find(|r| r.hosts == vec!["play.example.com"])
            .expect("lowercased host");
        assert_eq!(play.upstreams, vec!["10.0.0.1:25565"]);
        let other = cfg
            .routes
            .iter()
            .find(|r| r.hosts == vec!["other.example.com"])
            .unwrap();
        assert_eq!(other.upstreams.len(), 2);

        let _ = fs::remove_file(&p);
    }

    #[test]
    fn yaml_parses_tunnel_client_and_services() {
        let p = write_temp(
            "yaml",
            "yaml",
            r#"
tunnel:
  client:
    server_addr: "gw.example.com:7000"
    transport: "quic"
    quic:
      server_name: "gw.example.com"
  services:
    - name: "game"
      local_addr: "127.0.0.1:25565"
      remote_addr: ":25565"
    - name: "private"
      local_addr: "127.0.0.1:8080"
      route_only: true
      remote_addr: ":8081"
"#,
        );

        let cfg = load_config(&p).unwrap();
        let c = cfg.tunnel.client.as_ref().unwrap();
        assert_eq!(c.transport, "quic");
        assert_eq!(c.dial_timeout, Duration::from_secs(5));

        assert_eq!(cfg.tunnel.services.len(), 2);
        assert_eq!(cfg.tunnel.services[0].proto, "tcp");
        assert_eq!(cfg.tunnel.services[0].remote_addr, ":25565");
        // route_only clears remote_addr at load time already.
        assert!(cfg.tunnel.services[1].route_only);
        assert_eq!(cfg.tunnel.services[1].remote_addr, "");

        let _ = fs::remove_file(&p);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let missing_upstreams = write_temp(
            "inv1",
            "toml",
            r#"
[[routes]]
hosts = ["a.example.com"]
upstreams = []
"#,
        );
        assert!(load_config(&missing_upstreams).is_err());
        let _ = fs::remove_file(&missing_upstreams);

        let udp_no_upstream = write_temp(
            "inv2",
            "toml",
            r#"
[[listeners]]
listen_addr = ":19132"
protocol = "udp"
"#,
        );
        assert!(load_config(&udp_no_upstream).is_err());
        let _ = fs::remove_file(&udp_no_upstream);

        let bad_parser = write_temp(
            "inv3",
            "toml",
            r#"
[[routing_parsers]]
type = "lua"
name = "x"
"#,
        );
        assert!(load_config(&bad_parser).is_err());
        let _ = fs::remove_file(&bad_parser);
    }

    #[test]
    fn cache_ttl_forms() {
        assert_eq!(parse_cache_ttl(None, None).unwrap(), None);
        assert_eq!(
            parse_cache_ttl(Some("10s"), None).unwrap(),
            Some(Duration::from_secs(10))
        );
        assert_eq!(parse_cache_ttl(Some("-1"), None).unwrap(), None);
        assert_eq!(parse_cache_ttl(None, Some(-5)).unwrap(), None);
        assert_eq!(
            parse_cache_ttl(None, Some(1500)).unwrap(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn ensure_config_file_writes_template_once() {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "prism_cfg_dir_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        let path = dir.join("prism.toml");

        assert!(ensure_config_file(&path).unwrap());
        assert!(!ensure_config_file(&path).unwrap());

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.admin_addr, ":8080");
        assert_eq!(cfg.tunnel.listeners.len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }
}
