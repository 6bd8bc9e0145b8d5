use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use thiserror::Error;
use wasmer::{Engine, Instance, Memory, Module, Pages, Store, TypedFunction, imports};

use crate::prism::{config, wire};

/// Hard cap on a Minecraft handshake frame.
pub const MAX_HANDSHAKE_FRAME: usize = 256 * 1024;
/// Cap on the serverAddress field of a handshake.
pub const MAX_HANDSHAKE_HOST: usize = 255;
/// Default cap on a sandboxed parser's returned hostname.
pub const DEFAULT_WASM_OUTPUT_LEN: u32 = 255;

#[derive(Debug, Error)]
pub enum ParseError {
    /// The prelude is a possible prefix of this parser's protocol; feed more bytes.
    #[error("need more data")]
    NeedMoreData,
    /// Definitely not this parser's protocol.
    #[error("no match")]
    NoMatch,
    /// Looked like this parser's protocol but is malformed; drop the session.
    #[error("fatal parse error: {0}")]
    Fatal(String),
}

/// A stateless prelude-to-hostname parser.
///
/// Successful results are trimmed, lowercased and non-empty.
pub trait HostParser: Send + Sync {
    fn name(&self) -> &str;
    fn parse(&self, prelude: &[u8]) -> Result<String, ParseError>;
}

pub type SharedHostParser = Arc<dyn HostParser>;

fn normalize_host(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Runs child parsers in order: first success wins, `NeedMoreData` is sticky
/// until every child has definitively declined.
pub struct ChainHostParser {
    parsers: Vec<SharedHostParser>,
}

impl ChainHostParser {
    pub fn new(parsers: Vec<SharedHostParser>) -> Self {
        let parsers = parsers
            .into_iter()
            .filter(|p| !p.name().trim().is_empty())
            .collect();
        Self { parsers }
    }
}

impl HostParser for ChainHostParser {
    fn name(&self) -> &str {
        "chain"
    }

    fn parse(&self, prelude: &[u8]) -> Result<String, ParseError> {
        let mut need_more = false;
        for p in &self.parsers {
            match p.parse(prelude) {
                Ok(host) => {
                    let h = normalize_host(&host);
                    if h.is_empty() {
                        continue;
                    }
                    return Ok(h);
                }
                Err(ParseError::NeedMoreData) => need_more = true,
                Err(ParseError::NoMatch) => {}
                Err(e) => return Err(e),
            }
        }
        if need_more {
            Err(ParseError::NeedMoreData)
        } else {
            Err(ParseError::NoMatch)
        }
    }
}

/// Minecraft handshake: `[len varint][id=0 varint][protoVer varint][host lp-string][port u16be][nextState varint]`.
pub struct MinecraftHandshakeParser {
    max_frame_len: usize,
    max_host_len: usize,
}

#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub protocol_version: i32,
    pub host: String,
    pub port: u16,
    pub next_state: i32,
    /// Length of the whole frame including the length prefix.
    pub frame_len: usize,
}

impl MinecraftHandshakeParser {
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_HANDSHAKE_FRAME,
            max_host_len: MAX_HANDSHAKE_HOST,
        }
    }

    /// Decode the full handshake, including fields the routing path ignores.
    ///
    /// The status cache keys on `protocol_version` and replays on `next_state == 1`.
    pub fn decode(&self, prelude: &[u8]) -> Result<HandshakeInfo, ParseError> {
        let Some((pkt_len, len_n)) = wire::get_varint(prelude, 0) else {
            // Either a short prefix of the length varint or an over-long varint.
            if prelude.len() >= wire::MAX_VARINT_BYTES {
                return Err(ParseError::NoMatch);
            }
            return Err(ParseError::NeedMoreData);
        };
        if pkt_len < 0 || pkt_len as usize > self.max_frame_len {
            return Err(ParseError::NoMatch);
        }
        let pkt_len = pkt_len as usize;
        if len_n + pkt_len > prelude.len() {
            return Err(ParseError::NeedMoreData);
        }
        let frame_end = len_n + pkt_len;
        let mut i = len_n;

        let (packet_id, n) = wire::get_varint(&prelude[..frame_end], i)
            .ok_or(ParseError::NoMatch)?;
        i += n;
        if packet_id != 0 {
            return Err(ParseError::NoMatch);
        }

        let (protocol_version, n) = wire::get_varint(&prelude[..frame_end], i)
            .ok_or_else(|| ParseError::Fatal("handshake truncated at protocol version".into()))?;
        i += n;

        let (host_len, n) = wire::get_varint(&prelude[..frame_end], i)
            .ok_or_else(|| ParseError::Fatal("handshake truncated at host length".into()))?;
        i += n;
        if host_len < 0 || host_len as usize > self.max_host_len {
            return Err(ParseError::Fatal(format!("handshake host length {host_len} out of range")));
        }
        let host_len = host_len as usize;
        if i + host_len + 2 > frame_end {
            return Err(ParseError::Fatal("handshake host/port exceed frame".into()));
        }

        let host = normalize_host(&String::from_utf8_lossy(&prelude[i..i + host_len]));
        i += host_len;

        let port = u16::from_be_bytes([prelude[i], prelude[i + 1]]);
        i += 2;

        let (next_state, _n) = wire::get_varint(&prelude[..frame_end], i)
            .ok_or_else(|| ParseError::Fatal("handshake truncated at next state".into()))?;

        Ok(HandshakeInfo {
            protocol_version,
            host,
            port,
            next_state,
            frame_len: frame_end,
        })
    }
}

impl HostParser for MinecraftHandshakeParser {
    fn name(&self) -> &str {
        "minecraft_handshake"
    }

    fn parse(&self, prelude: &[u8]) -> Result<String, ParseError> {
        let info = self.decode(prelude)?;
        if info.host.is_empty() {
            return Err(ParseError::NoMatch);
        }
        Ok(info.host)
    }
}

/// TLS ClientHello: record header, handshake header, then the server_name
/// extension (type 0x0000, name_type 0x00).
pub struct TlsSniParser;

impl TlsSniParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_impl(&self, b: &[u8]) -> Result<String, ParseError> {
        // Record header: type(1) version(2) length(2).
        if !b.is_empty() && b[0] != 0x16 {
            return Err(ParseError::NoMatch);
        }
        if b.len() >= 2 && b[1] != 0x03 {
            return Err(ParseError::NoMatch);
        }
        if b.len() >= 3 && !(0x01..=0x04).contains(&b[2]) {
            return Err(ParseError::NoMatch);
        }
        if b.len() < 5 {
            return Err(ParseError::NeedMoreData);
        }

        let record_len = u16::from_be_bytes([b[3], b[4]]) as usize;
        let body = &b[5..];
        let avail = body.len().min(record_len);
        let body = &body[..avail];

        // Handshake header: msg_type(1) length(3).
        if !body.is_empty() && body[0] != 0x01 {
            return Err(ParseError::NoMatch);
        }
        if body.len() < 4 {
            return Err(ParseError::NeedMoreData);
        }
        let hello_len = u32::from_be_bytes([0, body[1], body[2], body[3]]) as usize;
        let hello = &body[4..];

        let mut i = 0usize;
        let need = |i: usize, n: usize| -> Result<(), ParseError> {
            if i + n > hello_len {
                return Err(ParseError::Fatal("client hello fields exceed declared length".into()));
            }
            if i + n > hello.len() {
                return Err(ParseError::NeedMoreData);
            }
            Ok(())
        };

        // client_version(2) + random(32).
        need(i, 34)?;
        i += 34;

        // session_id.
        need(i, 1)?;
        let sid_len = hello[i] as usize;
        i += 1;
        need(i, sid_len)?;
        i += sid_len;

        // cipher_suites.
        need(i, 2)?;
        let cs_len = u16::from_be_bytes([hello[i], hello[i + 1]]) as usize;
        i += 2;
        need(i, cs_len)?;
        i += cs_len;

        // compression_methods.
        need(i, 1)?;
        let cm_len = hello[i] as usize;
        i += 1;
        need(i, cm_len)?;
        i += cm_len;

        // No extensions at all: a hello without SNI is decidable.
        if i == hello_len {
            return Err(ParseError::NoMatch);
        }

        need(i, 2)?;
        let ext_total = u16::from_be_bytes([hello[i], hello[i + 1]]) as usize;
        i += 2;
        let ext_end = i + ext_total;
        if ext_end > hello_len {
            return Err(ParseError::Fatal("extensions exceed client hello".into()));
        }

        while i < ext_end {
            need(i, 4)?;
            let ext_type = u16::from_be_bytes([hello[i], hello[i + 1]]);
            let ext_len = u16::from_be_bytes([hello[i + 2], hello[i + 3]]) as usize;
            i += 4;
            if i + ext_len > ext_end {
                return Err(ParseError::Fatal("extension exceeds extension block".into()));
            }

            if ext_type != 0x0000 {
                need(i, ext_len)?;
                i += ext_len;
                continue;
            }

            // server_name extension: list_len(2), then {name_type(1), len(2), bytes}.
            need(i, 2)?;
            let mut j = i + 2;
            let list_end = i + ext_len;
            while j < list_end {
                need(j, 3)?;
                let name_type = hello[j];
                let name_len = u16::from_be_bytes([hello[j + 1], hello[j + 2]]) as usize;
                j += 3;
                if j + name_len > list_end {
                    return Err(ParseError::Fatal("server name exceeds extension".into()));
                }
                need(j, name_len)?;
                if name_type == 0x00 {
                    let host = normalize_host(&String::from_utf8_lossy(&hello[j..j + name_len]));
                    if host.is_empty() {
                        return Err(ParseError::NoMatch);
                    }
                    return Ok(host);
                }
                j += name_len;
            }

            return Err(ParseError::NoMatch);
        }

        // Scanned every extension in the declared block without finding SNI.
        Err(ParseError::NoMatch)
    }
}

impl HostParser for TlsSniParser {
    fn name(&self) -> &str {
        "tls_sni"
    }

    fn parse(&self, prelude: &[u8]) -> Result<String, ParseError> {
        if prelude.is_empty() {
            return Err(ParseError::NeedMoreData);
        }
        self.parse_impl(prelude)
    }
}

struct WasmInstanceState {
    store: Store,
    memory: Memory,
    func: TypedFunction<i32, i64>,
}

/// Sandboxed parser: a wasm module exporting linear memory `"memory"` and
/// `fn(inputLen: i32) -> i64`.
///
/// Result decoding: `0` NeedMore, `1` NoMatch, `-1` Fatal, otherwise
/// `{ptr = low32, len = high32}` of a hostname in the module's memory.
///
/// Instances are pooled; an instance that errors is discarded instead of being
/// returned to the pool. `close()` marks the parser dead so a replaced
/// snapshot's modules can be torn down after in-flight handshakes drain.
pub struct WasmHostParser {
    name: String,
    fn_name: String,
    max_output_len: u32,
    engine: Engine,
    module: Module,
    pool: Mutex<Vec<WasmInstanceState>>,
    closed: AtomicBool,
}

// wasmer's `Store`/`Instance` internals use raw pointers and are therefore
// not `Send`/`Sync` by default, but every access here is serialized through
// `pool`'s `Mutex`, so no two threads ever touch a `WasmInstanceState`
// concurrently.
unsafe impl Send for WasmHostParser {}
unsafe impl Sync for WasmHostParser {}

const WASM_POOL_CAP: usize = 8;

impl WasmHostParser {
    pub fn from_path(
        name: &str,
        path: &Path,
        function: Option<&str>,
        max_output_len: Option<u32>,
    ) -> anyhow::Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("parser: empty wasm parser name");
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("parser: read module {}", path.display()))?;
        Self::from_bytes(name, &bytes, function, max_output_len)
    }

    pub fn from_bytes(
        name: &str,
        bytes: &[u8],
        function: Option<&str>,
        max_output_len: Option<u32>,
    ) -> anyhow::Result<Self> {
        let engine = Engine::default();
        let store = Store::new(engine.clone());
        let module = Module::new(&store, bytes).context("parser: compile wasm module")?;

        Ok(Self {
            name: name.trim().to_string(),
            fn_name: function
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "prism_parse".into()),
            max_output_len: max_output_len.unwrap_or(DEFAULT_WASM_OUTPUT_LEN).max(1),
            engine,
            module,
            pool: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Drop pooled instances and refuse further parses.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut pool) = self.pool.lock() {
            pool.clear();
        }
    }

    fn acquire(&self) -> Result<WasmInstanceState, ParseError> {
        if let Ok(mut pool) = self.pool.lock() {
            if let Some(inst) = pool.pop() {
                return Ok(inst);
            }
        }
        self.instantiate().map_err(|e| ParseError::Fatal(e.to_string()))
    }

    fn release(&self, inst: WasmInstanceState) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < WASM_POOL_CAP {
                pool.push(inst);
            }
        }
    }

    fn instantiate(&self) -> anyhow::Result<WasmInstanceState> {
        let mut store = Store::new(self.engine.clone());
        let instance = Instance::new(&mut store, &self.module, &imports! {})
            .context("parser: instantiate wasm")?;

        let func: TypedFunction<i32, i64> = instance
            .exports
            .get_typed_function(&store, &self.fn_name)
            .with_context(|| format!("parser: wasm missing export {:?}", self.fn_name))?;

        let memory = instance
            .exports
            .get_memory("memory")
            .map_err(|e| anyhow::anyhow!("parser: wasm missing exported memory 'memory': {e}"))?
            .clone();

        Ok(WasmInstanceState { store, memory, func })
    }

    fn run(&self, inst: &mut WasmInstanceState, prelude: &[u8]) -> Result<String, ParseError> {
        let need = prelude.len() as u64;
        let mem_size = inst.memory.view(&inst.store).data_size();
        if need > mem_size {
            let pages = (need - mem_size).div_ceil(65536);
            inst.memory
                .grow(&mut inst.store, Pages(pages as u32))
                .map_err(|e| ParseError::Fatal(format!("wasm memory grow failed: {e}")))?;
        }

        if !prelude.is_empty() {
            inst.memory
                .view(&inst.store)
                .write(0, prelude)
                .map_err(|e| ParseError::Fatal(format!("wasm memory write failed: {e}")))?;
        }

        let out = inst
            .func
            .call(&mut inst.store, prelude.len() as i32)
            .map_err(|e| ParseError::Fatal(format!("wasm parse call failed: {e}")))?;

        match out {
            0 => return Err(ParseError::NeedMoreData),
            1 => return Err(ParseError::NoMatch),
            -1 => return Err(ParseError::Fatal("wasm parser fatal".into())),
            _ => {}
        }

        let ptr = (out as u64 & 0xffff_ffff) as u32;
        let len = ((out as u64) >> 32) as u32;
        if len == 0 {
            return Err(ParseError::NoMatch);
        }
        if len > self.max_output_len {
            return Err(ParseError::Fatal(format!("wasm hostname too long ({len})")));
        }

        let view = inst.memory.view(&inst.store);
        let end = (ptr as u64)
            .checked_add(len as u64)
            .ok_or_else(|| ParseError::Fatal("wasm output range overflow".into()))?;
        if end > view.data_size() {
            return Err(ParseError::Fatal(format!(
                "wasm output out of bounds (ptr={ptr}, len={len}, mem={})",
                view.data_size()
            )));
        }

        let mut buf = vec![0u8; len as usize];
        view.read(ptr as u64, &mut buf)
            .map_err(|e| ParseError::Fatal(format!("wasm memory read failed: {e}")))?;

        let host = normalize_host(&String::from_utf8_lossy(&buf));
        if host.is_empty() {
            return Err(ParseError::NoMatch);
        }
        Ok(host)
    }
}

impl HostParser for WasmHostParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn parse(&self, prelude: &[u8]) -> Result<String, ParseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ParseError::Fatal("wasm parser closed".into()));
        }

        let mut inst = self.acquire()?;
        let res = self.run(&mut inst, prelude);
        match &res {
            // NeedMore/NoMatch leave the instance healthy; Fatal discards it.
            Ok(_) | Err(ParseError::NeedMoreData) | Err(ParseError::NoMatch) => {
                self.release(inst);
            }
            Err(ParseError::Fatal(_)) => drop(inst),
        }
        res
    }
}

/// The per-snapshot parser stack: the chain used by the session handler plus
/// handles for tearing down sandboxed modules when the snapshot is retired.
pub struct ParserSet {
    chain: SharedHostParser,
    wasm: Vec<Arc<WasmHostParser>>,
}

impl ParserSet {
    pub fn chain(&self) -> SharedHostParser {
        self.chain.clone()
    }

    pub fn close(&self) {
        for w in &self.wasm {
            w.close();
        }
    }
}

/// Build the ordered parser chain from a snapshot's `routing_parsers`.
pub fn build_parser_set(specs: &[config::RoutingParserConfig]) -> anyhow::Result<ParserSet> {
    let mut parsers: Vec<SharedHostParser> = Vec::with_capacity(specs.len());
    let mut wasm = Vec::new();

    for (i, rp) in specs.iter().enumerate() {
        match rp.kind.as_str() {
            "builtin" => {
                let p = builtin_by_name(&rp.name)
                    .with_context(|| format!("routing_parsers[{i}]: unknown builtin {:?}", rp.name))?;
                parsers.push(p);
            }
            "wasm" => {
                let path = rp.path.trim();
                if path.is_empty() {
                    anyhow::bail!("routing_parsers[{i}]: wasm parser missing path");
                }
                let name = if rp.name.trim().is_empty() {
                    format!("wasm:{path}")
                } else {
                    rp.name.trim().to_string()
                };
                let p = Arc::new(WasmHostParser::from_path(
                    &name,
                    Path::new(path),
                    rp.function.as_deref(),
                    rp.max_output_len,
                )?);
                wasm.push(p.clone());
                parsers.push(p);
            }
            other => anyhow::bail!("routing_parsers[{i}]: unknown type {other:?} (expected builtin|wasm)"),
        }
    }

    if parsers.is_empty() {
        parsers.push(Arc::new(MinecraftHandshakeParser::new()));
        parsers.push(Arc::new(TlsSniParser::new()));
    }

    Ok(ParserSet {
        chain: Arc::new(ChainHostParser::new(parsers)),
        wasm,
    })
}

fn builtin_by_name(name: &str) -> anyhow::Result<SharedHostParser> {
    let n = name.trim().to_ascii_lowercase().replace('-', "_");
    match n.as_str() {
        "minecraft_handshake" | "minecraft" | "mc" => Ok(Arc::new(MinecraftHandshakeParser::new())),
        "tls_sni" | "sni" | "tls" => Ok(Arc::new(TlsSniParser::new())),
        _ => anyhow::bail!("no builtin parser named {name:?}"),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::prism::wire;

    pub fn build_handshake(host: &str, port: u16, proto_ver: i32, next_state: i32) -> Vec<u8> {
        let mut inner = Vec::new();
        wire::put_varint(&mut inner, 0);
        wire::put_varint(&mut inner, proto_ver);
        wire::put_string(&mut inner, host);
        inner.extend_from_slice(&port.to_be_bytes());
        wire::put_varint(&mut inner, next_state);

        let mut out = Vec::new();
        wire::put_varint(&mut out, inner.len() as i32);
        out.extend_from_slice(&inner);
        out
    }

    pub fn build_client_hello(sni: &str) -> Vec<u8> {
        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // client_version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session_id
        hello.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites len
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1); // compression_methods len
        hello.push(0);

        let name = sni.as_bytes();
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
        sni_ext.push(0x00); // host_name
        sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(name);

        let mut exts = Vec::new();
        // A leading unrelated extension exercises the scan.
        exts.extend_from_slice(&0x000au16.to_be_bytes());
        exts.extend_from_slice(&2u16.to_be_bytes());
        exts.extend_from_slice(&[0x00, 0x1d]);
        exts.extend_from_slice(&0x0000u16.to_be_bytes());
        exts.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni_ext);

        hello.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        hello.extend_from_slice(&exts);

        let mut hs = Vec::new();
        hs.push(0x01); // client_hello
        let l = hello.len() as u32;
        hs.extend_from_slice(&[(l >> 16) as u8, (l >> 8) as u8, l as u8]);
        hs.extend_from_slice(&hello);

        let mut rec = Vec::new();
        rec.push(0x16);
        rec.extend_from_slice(&[0x03, 0x03]);
        rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        rec.extend_from_slice(&hs);
        rec
    }
}
