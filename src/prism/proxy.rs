use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::watch,
    time,
};

use crate::prism::{
    bridge, dialer,
    net,
    parser::{self, ParseError},
    pingcache, router, telemetry,
};

/// Per-snapshot knobs shared by the TCP handlers.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_header_bytes: usize,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            handshake_timeout: Duration::from_secs(3),
            idle_timeout: Duration::ZERO,
        }
    }
}

/// Everything a routing session needs, bound to one config snapshot.
///
/// Listeners hold an `ArcSwap` of this and load it once per accepted
/// connection, so a snapshot swap never tears live sessions.
pub struct RoutingState {
    pub parser: parser::SharedHostParser,
    pub router: Arc<router::Router>,
    pub dialer: dialer::Dialer,
    pub bridge: Arc<bridge::Bridge>,
    pub limits: Limits,
    pub metrics: telemetry::SharedMetrics,
    pub sessions: telemetry::SharedSessions,
}

pub struct ForwardState {
    pub upstream: String,
    pub dialer: dialer::Dialer,
    pub bridge: Arc<bridge::Bridge>,
    pub limits: Limits,
    pub metrics: telemetry::SharedMetrics,
    pub sessions: telemetry::SharedSessions,
}

#[derive(Clone)]
pub enum TcpHandler {
    Routing(Arc<ArcSwap<RoutingState>>),
    Forward(Arc<ArcSwap<ForwardState>>),
}

impl TcpHandler {
    pub async fn handle(&self, conn: TcpStream, shutdown: watch::Receiver<bool>) {
        match self {
            TcpHandler::Routing(st) => handle_routing(conn, st.load_full(), shutdown).await,
            TcpHandler::Forward(st) => handle_forward(conn, st.load_full(), shutdown).await,
        }
    }
}

pub async fn serve_tcp(
    listen_addr: &str,
    handler: TcpHandler,
    tracker: Option<Arc<telemetry::ListenerTracker>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "tcp: listening");
    let _guard = tracker.as_ref().map(|t| t.listener_up());

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let h = handler.clone();
                let sh = shutdown.clone();
                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "tcp: accepted");
                    }
                    h.handle(conn, sh).await;
                });
            }
        }
    }

    Ok(())
}

enum CaptureVerdict {
    Host(String),
    /// Peer went away mid-capture; nothing worth logging.
    Silent,
    Debug(&'static str),
    Fatal(String),
}

async fn capture_host(
    conn: &mut TcpStream,
    captured: &mut Vec<u8>,
    chain: &parser::SharedHostParser,
    max_header: usize,
) -> CaptureVerdict {
    let mut tmp = vec![0u8; 4096];
    loop {
        if captured.len() >= max_header {
            return CaptureVerdict::Debug("max header bytes exceeded with no host");
        }

        let n = match conn.read(&mut tmp).await {
            Ok(0) => return CaptureVerdict::Silent,
            Ok(n) => n,
            Err(_) => return CaptureVerdict::Silent,
        };
        let take = n.min(max_header - captured.len());
        captured.extend_from_slice(&tmp[..take]);

        match chain.parse(captured) {
            Ok(host) => return CaptureVerdict::Host(host),
            Err(ParseError::NeedMoreData) => continue,
            Err(ParseError::NoMatch) => return CaptureVerdict::Debug("no parser matched prelude"),
            Err(ParseError::Fatal(e)) => return CaptureVerdict::Fatal(e),
        }
    }
}

async fn handle_routing(
    mut conn: TcpStream,
    st: Arc<RoutingState>,
    shutdown: watch::Receiver<bool>,
) {
    let _active = st.metrics.track_conn();
    let sid = telemetry::new_session_id();
    let client = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();

    let max_header = st.limits.max_header_bytes.max(1);
    let mut captured: Vec<u8> = Vec::with_capacity(4096.min(max_header));

    let verdict = {
        let fut = capture_host(&mut conn, &mut captured, &st.parser, max_header);
        if st.limits.handshake_timeout > Duration::ZERO {
            match time::timeout(st.limits.handshake_timeout, fut).await {
                Ok(v) => v,
                Err(_) => {
                    tracing::debug!(sid = %sid, client = %client, "proxy: handshake timeout");
                    let _ = conn.shutdown().await;
                    return;
                }
            }
        } else {
            fut.await
        }
    };

    let host = match verdict {
        CaptureVerdict::Host(h) => h,
        CaptureVerdict::Silent => {
            let _ = conn.shutdown().await;
            return;
        }
        CaptureVerdict::Debug(why) => {
            tracing::debug!(sid = %sid, client = %client, "proxy: {why}");
            let _ = conn.shutdown().await;
            return;
        }
        CaptureVerdict::Fatal(err) => {
            tracing::warn!(sid = %sid, client = %client, err = %err, "proxy: prelude parse failed");
            let _ = conn.shutdown().await;
            return;
        }
    };

    let Some(res) = st.router.resolve(&host) else {
        tracing::debug!(sid = %sid, client = %client, host = %host, "proxy: no route for host");
        let _ = conn.shutdown().await;
        return;
    };
    st.metrics.route_hit(&host);

    let default_port = handshake_port(&captured)
        .or_else(|| conn.local_addr().ok().map(|a| a.port()))
        .unwrap_or(25565);

    if try_serve_cached_status(&mut conn, &mut captured, &sid, &client, &res, default_port, &st)
        .await
    {
        return;
    }

    // Dial candidates with failover, in the order the router chose.
    let mut last_err: Option<anyhow::Error> = None;
    let mut dialed = None;
    for cand in &res.upstreams {
        match st.dialer.dial(cand, Some(default_port)).await {
            Ok(ok) => {
                dialed = Some(ok);
                break;
            }
            Err(err) => last_err = Some(err),
        }
    }
    let Some((mut up, upstream_label)) = dialed else {
        let err = last_err.map(|e| e.to_string()).unwrap_or_default();
        tracing::warn!(sid = %sid, client = %client, host = %host, err = %err, "proxy: upstream dial failed");
        let _ = conn.shutdown().await;
        return;
    };

    st.sessions.add(telemetry::SessionInfo {
        id: sid.clone(),
        client: client.clone(),
        host: host.clone(),
        upstream: upstream_label.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });

    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(sid = %sid, host = %host, upstream = %upstream_label, "proxy: routed");
    }

    let outcome = async {
        if let (Ok(src), Ok(dst)) = (conn.peer_addr(), conn.local_addr()) {
            st.bridge.write_preamble(&mut up, src, dst).await?;
        }
        // Forward the already-captured prelude unchanged.
        up.write_all(&captured).await?;
        st.bridge.run(conn, up, st.limits.idle_timeout, shutdown).await
    }
    .await;

    st.sessions.remove(&sid);

    match outcome {
        Ok((ingress, egress)) => st.metrics.add_bytes(ingress, egress),
        Err(err) => {
            tracing::debug!(sid = %sid, err = %err, "proxy: session ended with error");
        }
    }
}

async fn handle_forward(
    mut conn: TcpStream,
    st: Arc<ForwardState>,
    shutdown: watch::Receiver<bool>,
) {
    let _active = st.metrics.track_conn();
    let sid = telemetry::new_session_id();
    let client = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();

    let upstream = st.upstream.trim();
    if upstream.is_empty() {
        let _ = conn.shutdown().await;
        return;
    }

    let (mut up, upstream_label) = match st.dialer.dial(upstream, None).await {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(sid = %sid, client = %client, upstream = %upstream, err = %err, "proxy: forward dial failed");
            let _ = conn.shutdown().await;
            return;
        }
    };

    st.sessions.add(telemetry::SessionInfo {
        id: sid.clone(),
        client,
        host: "".into(),
        upstream: upstream_label,
        started_at_unix_ms: telemetry::now_unix_ms(),
    });

    let outcome = async {
        if let (Ok(src), Ok(dst)) = (conn.peer_addr(), conn.local_addr()) {
            st.bridge.write_preamble(&mut up, src, dst).await?;
        }
        st.bridge.run(conn, up, st.limits.idle_timeout, shutdown).await
    }
    .await;

    st.sessions.remove(&sid);

    match outcome {
        Ok((ingress, egress)) => st.metrics.add_bytes(ingress, egress),
        Err(err) => {
            tracing::debug!(sid = %sid, err = %err, "proxy: forward ended with error");
        }
    }
}

// --- UDP forwarding ------------------------------------------------------

pub struct UdpForwardState {
    pub upstream: String,
    pub dialer: dialer::Dialer,
    pub idle_timeout: Duration,
    pub metrics: telemetry::SharedMetrics,
    pub sessions: telemetry::SharedSessions,
}

pub async fn serve_udp(
    listen_addr: &str,
    state: Arc<ArcSwap<UdpForwardState>>,
    tracker: Option<Arc<telemetry::ListenerTracker>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind = net::normalize_bind_addr(listen_addr);
    let sock = UdpSocket::bind(bind.as_ref())
        .await
        .with_context(|| format!("bind udp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "udp: listening");
    let _guard = tracker.as_ref().map(|t| t.listener_up());

    let sock = Arc::new(sock);
    let flows: Arc<DashMap<SocketAddr, Arc<UdpFlow>>> = Arc::new(DashMap::new());

    {
        let flows = flows.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(udp_sweep_loop(flows, state, shutdown));
    }

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = sock.recv_from(&mut buf) => {
                let (n, src) = res?;
                if n == 0 {
                    continue;
                }
                let payload = buf[..n].to_vec();

                let mut flow = flows
                    .get(&src)
                    .map(|f| f.value().clone())
                    .unwrap_or_else(|| {
                        let f = UdpFlow::spawn(state.load_full(), src, sock.clone());
                        flows.insert(src, f.clone());
                        f
                    });

                flow.touch();
                if flow.tx.try_send(payload).is_err() {
                    // Flow closed or congested; recreate once and re-send best effort.
                    flows.remove(&src);
                    flow = UdpFlow::spawn(state.load_full(), src, sock.clone());
                    flows.insert(src, flow.clone());
                    let _ = flow.tx.try_send(buf[..n].to_vec());
                }
            }
        }
    }

    Ok(())
}

/// One NAT entry: datagrams from `src` relay to a dedicated upstream.
struct UdpFlow {
    sid: String,
    tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    last_seen_ms: std::sync::atomic::AtomicU64,
}

impl UdpFlow {
    fn spawn(st: Arc<UdpForwardState>, src: SocketAddr, sock: Arc<UdpSocket>) -> Arc<Self> {
        let (tx, rx) = tokio::sync::mpsc::channel::<Vec<u8>>(128);
        let sid = telemetry::new_session_id();

        let flow = Arc::new(Self {
            sid: sid.clone(),
            tx,
            last_seen_ms: std::sync::atomic::AtomicU64::new(telemetry::now_unix_ms()),
        });

        st.sessions.add(telemetry::SessionInfo {
            id: sid.clone(),
            client: src.to_string(),
            host: "".into(),
            upstream: st.upstream.clone(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        });

        tokio::spawn(async move {
            let res = udp_flow_loop(&st, src, sock, rx).await;
            st.sessions.remove(&sid);
            if let Err(err) = res {
                tracing::debug!(sid = %sid, err = %err, "udp: flow ended");
            }
        });

        flow
    }

    fn touch(&self) {
        self.last_seen_ms.store(
            telemetry::now_unix_ms(),
            std::sync::atomic::Ordering::Relaxed,
        );
    }

    fn last_seen(&self) -> u64 {
        self.last_seen_ms.load(std::sync::atomic::Ordering::Relaxed)
    }
}

async fn udp_flow_loop(
    st: &UdpForwardState,
    src: SocketAddr,
    sock: Arc<UdpSocket>,
    mut rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];

    match st.dialer.dial_udp(&st.upstream).await? {
        dialer::UdpUpstream::Socket(up) => loop {
            tokio::select! {
                payload = rx.recv() => {
                    let Some(payload) = payload else { break };
                    let _ = up.send(&payload).await;
                }
                res = up.recv(&mut buf) => {
                    let n = res?;
                    let _ = sock.send_to(&buf[..n], src).await;
                }
            }
        },
        dialer::UdpUpstream::Tunnel(up) => {
            // Frame reads must not race the write side; run the return pump
            // as its own task.
            let (mut rd, mut wr) = up.split();
            let sock_back = sock.clone();
            let mut pump = tokio::spawn(async move {
                let mut back = vec![0u8; 64 * 1024];
                loop {
                    match rd.read_datagram(&mut back).await {
                        Ok(n) => {
                            let _ = sock_back.send_to(&back[..n], src).await;
                        }
                        Err(_) => break,
                    }
                }
            });

            loop {
                tokio::select! {
                    _ = &mut pump => break,
                    payload = rx.recv() => {
                        let Some(payload) = payload else { break };
                        if let Err(e) = wr.write_datagram(&payload).await {
                            pump.abort();
                            anyhow::bail!("tunnel udp write: {e}");
                        }
                    }
                }
            }
            pump.abort();
        }
    }

    Ok(())
}

async fn udp_sweep_loop(
    flows: Arc<DashMap<SocketAddr, Arc<UdpFlow>>>,
    state: Arc<ArcSwap<UdpForwardState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {}
        }

        let idle = state.load().idle_timeout;
        if idle <= Duration::ZERO {
            continue;
        }

        let now = telemetry::now_unix_ms();
        let idle_ms = idle.as_millis() as u64;
        let expired: Vec<SocketAddr> = flows
            .iter()
            .filter(|e| now.saturating_sub(e.value().last_seen()) > idle_ms)
            .map(|e| *e.key())
            .collect();

        for k in expired {
            if let Some((_k, flow)) = flows.remove(&k) {
                tracing::debug!(sid = %flow.sid, "udp: flow idle, evicted");
                // Dropping the sender ends the flow loop.
            }
        }
    }
}

// --- Minecraft status replay ---------------------------------------------

fn status_cache() -> &'static pingcache::StatusCache {
    static CACHE: OnceLock<pingcache::StatusCache> = OnceLock::new();
    CACHE.get_or_init(pingcache::StatusCache::new)
}

fn handshake_port(prelude: &[u8]) -> Option<u16> {
    parser::MinecraftHandshakeParser::new()
        .decode(prelude)
        .ok()
        .map(|i| i.port)
}

/// Split a complete `[len varint][payload]` frame off the front of `buf`.
/// Returns `(total_len, packet_id)` once fully buffered.
fn peek_frame(buf: &[u8], max_len: usize) -> anyhow::Result<Option<(usize, i32)>> {
    let Some((pkt_len, len_n)) = crate::prism::wire::get_varint(buf, 0) else {
        if buf.len() >= crate::prism::wire::MAX_VARINT_BYTES {
            anyhow::bail!("status: invalid frame length varint");
        }
        return Ok(None);
    };
    if pkt_len < 0 {
        anyhow::bail!("status: negative frame length");
    }
    let pkt_len = pkt_len as usize;
    if pkt_len > max_len {
        anyhow::bail!("status: frame too large ({pkt_len} > {max_len})");
    }
    let total = len_n + pkt_len;
    if buf.len() < total {
        return Ok(None);
    }
    let (pid, _n) = crate::prism::wire::get_varint(&buf[..total], len_n)
        .context("status: missing packet id")?;
    Ok(Some((total, pid)))
}

/// Read one frame using `buf` as read-ahead; bytes beyond the frame stay in
/// `buf`. Returns `None` on clean EOF before any frame or on timeout.
async fn read_frame_buffered(
    conn: &mut TcpStream,
    buf: &mut Vec<u8>,
    max_len: usize,
    timeout: Duration,
) -> anyhow::Result<Option<(Vec<u8>, i32)>> {
    let fut = async {
        let mut tmp = vec![0u8; 4096];
        loop {
            if let Some((total, pid)) = peek_frame(buf, max_len)? {
                let raw: Vec<u8> = buf.drain(..total).collect();
                return Ok(Some((raw, pid)));
            }
            let n = conn.read(&mut tmp).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                anyhow::bail!("status: eof inside frame");
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    };

    if timeout > Duration::ZERO {
        match time::timeout(timeout, fut).await {
            Ok(v) => v,
            Err(_) => Ok(None),
        }
    } else {
        fut.await
    }
}

async fn read_frame_stream(
    r: &mut (dyn AsyncRead + Unpin + Send),
    max_len: usize,
    timeout: Duration,
) -> anyhow::Result<(Vec<u8>, i32)> {
    let fut = async {
        let mut buf = Vec::with_capacity(512);
        let mut byte = [0u8; 1];
        loop {
            if let Some((total, pid)) = peek_frame(&buf, max_len)? {
                while buf.len() < total {
                    r.read_exact(&mut byte).await?;
                    buf.push(byte[0]);
                }
                let raw: Vec<u8> = buf.drain(..total).collect();
                return Ok((raw, pid));
            }
            r.read_exact(&mut byte).await?;
            buf.push(byte[0]);
        }
    };

    if timeout > Duration::ZERO {
        time::timeout(timeout, fut)
            .await
            .context("status: frame read timeout")?
    } else {
        fut.await
    }
}

fn status_upstream_key(candidate: &str, default_port: u16) -> String {
    let addr = candidate.trim();
    if addr.is_empty() || addr.to_ascii_lowercase().starts_with("tunnel:") {
        return addr.to_string();
    }
    if net::needs_port(addr) {
        return format!("{addr}:{default_port}");
    }
    addr.to_string()
}

/// Serve a Status-phase handshake from the ping cache when the route enables
/// it. Returns true when the session was fully answered here. On any bail-out
/// the consumed bytes are restored into `captured` so normal proxying
/// continues unaffected.
async fn try_serve_cached_status(
    conn: &mut TcpStream,
    captured: &mut Vec<u8>,
    sid: &str,
    client: &str,
    res: &router::Resolution,
    default_port: u16,
    st: &Arc<RoutingState>,
) -> bool {
    let Some(ttl) = res.cache_ping_ttl.filter(|d| *d > Duration::ZERO) else {
        return false;
    };

    let Ok(hs) = parser::MinecraftHandshakeParser::new().decode(captured) else {
        return false;
    };
    if hs.next_state != 1 {
        return false;
    }

    let handshake_raw = captured[..hs.frame_len].to_vec();
    let mut post = captured[hs.frame_len..].to_vec();

    let req = read_frame_buffered(conn, &mut post, 64 * 1024, st.limits.handshake_timeout).await;
    let Ok(Some((status_req_raw, status_pid))) = req else {
        let mut restored = handshake_raw;
        restored.extend_from_slice(&post);
        *captured = restored;
        return false;
    };

    // Keep fallback possible from here on.
    let mut restored = handshake_raw.clone();
    restored.extend_from_slice(&status_req_raw);
    restored.extend_from_slice(&post);
    *captured = restored;

    if status_pid != 0 {
        return false;
    }

    let addrs = conn.peer_addr().ok().zip(conn.local_addr().ok());

    for cand in &res.upstreams {
        let upstream_key = status_upstream_key(cand, default_port);
        if upstream_key.is_empty() {
            continue;
        }
        let key = pingcache::StatusKey {
            upstream: upstream_key.clone(),
            protocol_version: hs.protocol_version,
        };

        let loaded = status_cache()
            .get_or_load(key, ttl, || {
                let dialer = st.dialer.clone();
                let bridge = st.bridge.clone();
                let upstream = upstream_key.clone();
                let handshake = handshake_raw.clone();
                let request = status_req_raw.clone();
                let read_timeout = st.limits.handshake_timeout;
                async move {
                    let (mut up, _label) = dialer.dial(&upstream, None).await?;
                    if let Some((src, dst)) = addrs {
                        bridge.write_preamble(&mut up, src, dst).await?;
                    }
                    up.write_all(&handshake).await.context("status: write handshake")?;
                    up.write_all(&request).await.context("status: write request")?;
                    let (raw, pid) = read_frame_stream(&mut *up, 512 * 1024, read_timeout).await?;
                    if pid != 0 {
                        anyhow::bail!("status: unexpected response packet id {pid}");
                    }
                    Ok(raw)
                }
            })
            .await;

        let resp = match loaded {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(sid = %sid, upstream = %upstream_key, err = %err, "status: load failed");
                continue;
            }
        };

        st.sessions.add(telemetry::SessionInfo {
            id: sid.to_string(),
            client: client.to_string(),
            host: res.host.clone(),
            upstream: upstream_key,
            started_at_unix_ms: telemetry::now_unix_ms(),
        });

        let _ = conn.write_all(&resp).await;
        // Answer the follow-up ping locally.
        if let Ok(Some((ping_raw, 1))) =
            read_frame_buffered(conn, &mut post, 64 * 1024, st.limits.handshake_timeout).await
        {
            let _ = conn.write_all(&ping_raw).await;
        }
        let _ = conn.shutdown().await;
        st.sessions.remove(sid);
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prism::parser::testutil::build_handshake;
    use crate::prism::wire;

    fn test_state(routes: &[crate::prism::config::RouteConfig], limits: Limits) -> Arc<ArcSwap<RoutingState>> {
        let set = parser::build_parser_set(&[]).expect("parsers");
        Arc::new(ArcSwap::from_pointee(RoutingState {
            parser: set.chain(),
            router: Arc::new(router::Router::new(routes)),
            dialer: dialer::Dialer::new(Duration::from_secs(2), None),
            bridge: Arc::new(bridge::Bridge::new(16 * 1024, false)),
            limits,
            metrics: Arc::new(telemetry::MetricsCollector::new()),
            sessions: Arc::new(telemetry::SessionRegistry::new()),
        }))
    }

    fn route_to(host: &str, upstream: &str, ttl: Option<Duration>) -> crate::prism::config::RouteConfig {
        crate::prism::config::RouteConfig {
            hosts: vec![host.into()],
            upstreams: vec![upstream.into()],
            strategy: "sequential".into(),
            cache_ping_ttl: ttl,
        }
    }

    async fn spawn_routing_listener(state: Arc<ArcSwap<RoutingState>>) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (c, _) = ln.accept().await.unwrap();
                let st = state.clone();
                let (_tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    TcpHandler::Routing(st).handle(c, rx).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn routes_handshake_and_forwards_all_bytes() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let handshake = build_handshake("play.example.com", 25565, 763, 2);
        let expected = [handshake.clone(), b"hello".to_vec()].concat();

        let backend_task = tokio::spawn(async move {
            let (mut s, _) = backend.accept().await.unwrap();
            let mut got = vec![0u8; expected.len()];
            s.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
            s.write_all(b"world").await.unwrap();
        });

        let state = test_state(
            &[route_to("play.example.com", &backend_addr.to_string(), None)],
            Limits::default(),
        );
        let proxy_addr = spawn_routing_listener(state).await;

        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        c.write_all(&handshake).await.unwrap();
        c.write_all(b"hello").await.unwrap();

        let mut got = [0u8; 5];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");

        backend_task.await.unwrap();
    }

    #[tokio::test]
    async fn unroutable_host_is_dropped() {
        let state = test_state(&[route_to("known.example.com", "127.0.0.1:1", None)], Limits::default());
        let proxy_addr = spawn_routing_listener(state).await;

        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        c.write_all(&build_handshake("other.example.com", 25565, 763, 2))
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        let n = c.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "connection should be closed without payload");
    }

    #[tokio::test]
    async fn garbage_prelude_is_dropped() {
        let state = test_state(&[route_to("known.example.com", "127.0.0.1:1", None)], Limits::default());
        let proxy_addr = spawn_routing_listener(state).await;

        let mut c = TcpStream::connect(proxy_addr).await.unwrap();
        c.write_all(b"\xff\xff\xff\xff\xffgarbage").await.unwrap();

        let mut buf = [0u8; 1];
        let n = c.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn forward_handler_skips_parsing() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut s, _) = backend.accept().await.unwrap();
            let mut got = [0u8; 9];
            s.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"arbitrary");
        });

        let st = Arc::new(ArcSwap::from_pointee(ForwardState {
            upstream: backend_addr.to_string(),
            dialer: dialer::Dialer::new(Duration::from_secs(2), None),
            bridge: Arc::new(bridge::Bridge::new(16 * 1024, false)),
            limits: Limits::default(),
            metrics: Arc::new(telemetry::MetricsCollector::new()),
            sessions: Arc::new(telemetry::SessionRegistry::new()),
        }));

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let (c, _) = ln.accept().await.unwrap();
            let (_tx, rx) = watch::channel(false);
            TcpHandler::Forward(st).handle(c, rx).await;
        });

        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(b"arbitrary").await.unwrap();
        c.shutdown().await.unwrap();
        backend_task.await.unwrap();
    }

    fn build_status_request() -> Vec<u8> {
        let mut payload = Vec::new();
        wire::put_varint(&mut payload, 0);
        let mut out = Vec::new();
        wire::put_varint(&mut out, payload.len() as i32);
        out.extend_from_slice(&payload);
        out
    }

    fn build_status_response(json: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        wire::put_varint(&mut payload, 0);
        wire::put_string(&mut payload, json);
        let mut out = Vec::new();
        wire::put_varint(&mut out, payload.len() as i32);
        out.extend_from_slice(&payload);
        out
    }

    fn build_ping(v: i64) -> Vec<u8> {
        let mut payload = Vec::new();
        wire::put_varint(&mut payload, 1);
        payload.extend_from_slice(&v.to_be_bytes());
        let mut out = Vec::new();
        wire::put_varint(&mut out, payload.len() as i32);
        out.extend_from_slice(&payload);
        out
    }

    #[tokio::test]
    async fn status_replay_serves_second_ping_from_cache() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        // Unique host per test run keys a fresh cache entry in the process-wide cache.
        let host = format!("ping-{}.example.com", backend_addr.port());

        let handshake = build_handshake(&host, 25565, 763, 1);
        let status_req = build_status_request();

        let backend_task = tokio::spawn({
            let handshake = handshake.clone();
            let status_req = status_req.clone();
            async move {
                let (mut s, _) = backend.accept().await.unwrap();
                let mut got = vec![0u8; handshake.len() + status_req.len()];
                s.read_exact(&mut got).await.unwrap();
                assert_eq!(got, [handshake, status_req].concat());
                s.write_all(&build_status_response(r#"{"description":"hi"}"#))
                    .await
                    .unwrap();
            }
        });

        let state = test_state(
            &[route_to(&host, &backend_addr.to_string(), Some(Duration::from_secs(30)))],
            Limits {
                handshake_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_secs(2),
                ..Limits::default()
            },
        );
        let proxy_addr = spawn_routing_listener(state).await;

        for ping_payload in [42i64, 7i64] {
            let mut c = TcpStream::connect(proxy_addr).await.unwrap();
            c.write_all(&handshake).await.unwrap();
            c.write_all(&status_req).await.unwrap();

            let (_raw, pid) =
                read_frame_stream(&mut c, 512 * 1024, Duration::from_secs(2)).await.unwrap();
            assert_eq!(pid, 0);

            c.write_all(&build_ping(ping_payload)).await.unwrap();
            let (_raw, pid) =
                read_frame_stream(&mut c, 512 * 1024, Duration::from_secs(2)).await.unwrap();
            assert_eq!(pid, 1);
        }

        // The backend accepted exactly one connection; the second round was cache-served.
        backend_task.await.unwrap();
    }

    #[test]
    fn peek_frame_incomplete_and_invalid() {
        assert!(peek_frame(&[], 1024).unwrap().is_none());
        let mut frame = Vec::new();
        wire::put_varint(&mut frame, 3);
        frame.extend_from_slice(&[0, 1]);
        assert!(peek_frame(&frame, 1024).unwrap().is_none());
        frame.push(2);
        let (total, pid) = peek_frame(&frame, 1024).unwrap().unwrap();
        assert_eq!(total, frame.len());
        assert_eq!(pid, 0);
        assert!(peek_frame(&frame, 2).is_err());
    }
}
