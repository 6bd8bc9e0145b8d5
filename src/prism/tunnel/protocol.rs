use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::prism::wire;

const MAGIC_REGISTER: &[u8; 4] = b"PRRG";
const MAGIC_PROXY_TCP: &[u8; 4] = b"PRPX";
const MAGIC_PROXY_UDP: &[u8; 4] = b"PRPU";
const PROTOCOL_V1: u8 = 1;

pub const MAX_REGISTER_PAYLOAD: u32 = 1 << 20; // 1 MiB
pub const MAX_DATAGRAM_BYTES: u32 = 1 << 20; // 1 MiB
const MAX_SERVICE_NAME: usize = 255;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("empty service name")]
    EmptyService,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wire: {0}")]
    Wire(#[from] wire::WireError),
}

/// A service a tunnel client offers to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredService {
    pub name: String,
    /// "tcp" or "udp"; defaults to tcp.
    #[serde(default)]
    pub proto: String,
    /// Backend address reachable from the client's side.
    #[serde(default)]
    pub local_addr: String,
    /// Routing via `tunnel:<name>` only; forbids public exposure.
    #[serde(default)]
    pub route_only: bool,
    /// Requested public listen address on the gateway, if any.
    #[serde(default)]
    pub remote_addr: String,
}

impl RegisteredService {
    /// Trim and default fields; `route_only` clears any `remote_addr`.
    /// Returns `None` when the name is empty.
    pub fn normalize(mut self) -> Option<Self> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return None;
        }
        self.proto = self.proto.trim().to_ascii_lowercase();
        if self.proto.is_empty() {
            self.proto = "tcp".into();
        }
        self.local_addr = self.local_addr.trim().to_string();
        self.remote_addr = self.remote_addr.trim().to_string();
        if self.route_only {
            self.remote_addr.clear();
        }
        Some(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub services: Vec<RegisteredService>,
}

/// `magic "PRRG" | version | u32be len | JSON payload`
pub async fn write_register_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &RegisterRequest,
) -> Result<(), ProtocolError> {
    w.write_all(MAGIC_REGISTER).await?;
    w.write_u8(PROTOCOL_V1).await?;

    let body = serde_json::to_vec(req)?;
    let n: u32 = body.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_REGISTER_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(&body).await?;
    Ok(())
}

pub async fn read_register_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<RegisterRequest, ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC_REGISTER {
        return Err(ProtocolError::BadMagic);
    }

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }

    let n = r.read_u32().await?;
    if n > MAX_REGISTER_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    let mut body = vec![0u8; n as usize];
    r.read_exact(&mut body).await?;
    let mut req: RegisterRequest = serde_json::from_slice(&body)?;

    let services = std::mem::take(&mut req.services);
    req.services = services
        .into_iter()
        .filter_map(RegisteredService::normalize)
        .collect();
    Ok(req)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStreamKind {
    Tcp,
    Udp,
}

/// `magic "PRPX"|"PRPU" | version | varint-string service`
pub async fn write_proxy_stream_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: ProxyStreamKind,
    service: &str,
) -> Result<(), ProtocolError> {
    let service = service.trim();
    if service.is_empty() {
        return Err(ProtocolError::EmptyService);
    }

    match kind {
        ProxyStreamKind::Tcp => w.write_all(MAGIC_PROXY_TCP).await?,
        ProxyStreamKind::Udp => w.write_all(MAGIC_PROXY_UDP).await?,
    }
    w.write_u8(PROTOCOL_V1).await?;
    wire::write_string(w, service).await?;
    Ok(())
}

pub async fn read_proxy_stream_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(ProxyStreamKind, String), ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    let kind = if &magic == MAGIC_PROXY_TCP {
        ProxyStreamKind::Tcp
    } else if &magic == MAGIC_PROXY_UDP {
        ProxyStreamKind::Udp
    } else {
        return Err(ProtocolError::BadMagic);
    };

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }

    let service = wire::read_string(r, MAX_SERVICE_NAME).await?;
    let service = service.trim().to_string();
    if service.is_empty() {
        return Err(ProtocolError::EmptyService);
    }
    Ok((kind, service))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_roundtrip_normalizes_services() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let req = RegisterRequest {
            token: "secret".into(),
            services: vec![
                RegisteredService {
                    name: "  game ".into(),
                    proto: "".into(),
                    local_addr: " 127.0.0.1:25565 ".into(),
                    route_only: false,
                    remote_addr: " :25565 ".into(),
                },
                RegisteredService {
                    name: "   ".into(),
                    proto: "tcp".into(),
                    local_addr: "x".into(),
                    route_only: false,
                    remote_addr: "".into(),
                },
                RegisteredService {
                    name: "voice".into(),
                    proto: "UDP".into(),
                    local_addr: "127.0.0.1:19132".into(),
                    route_only: true,
                    remote_addr: "127.0.0.1:9999".into(),
                },
            ],
        };

        let w = tokio::spawn(async move { write_register_request(&mut a, &req).await });
        let got = read_register_request(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got.token, "secret");
        assert_eq!(got.services.len(), 2);

        assert_eq!(got.services[0].name, "game");
        assert_eq!(got.services[0].proto, "tcp");
        assert_eq!(got.services[0].local_addr, "127.0.0.1:25565");
        assert_eq!(got.services[0].remote_addr, ":25565");

        assert_eq!(got.services[1].name, "voice");
        assert_eq!(got.services[1].proto, "udp");
        assert!(got.services[1].route_only);
        assert_eq!(got.services[1].remote_addr, "");
    }

    #[tokio::test]
    async fn register_rejects_oversized_length_before_payload() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            a.write_all(MAGIC_REGISTER).await.unwrap();
            a.write_u8(PROTOCOL_V1).await.unwrap();
            a.write_u32(MAX_REGISTER_PAYLOAD + 1).await.unwrap();
        });

        match read_register_request(&mut b).await.unwrap_err() {
            ProtocolError::PayloadTooLarge(n) => assert!(n > MAX_REGISTER_PAYLOAD),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_rejects_bad_magic() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            a.write_all(b"NOPE").await.unwrap();
            a.write_u8(PROTOCOL_V1).await.unwrap();
        });
        assert!(matches!(
            read_register_request(&mut b).await.unwrap_err(),
            ProtocolError::BadMagic
        ));
    }

    #[tokio::test]
    async fn proxy_header_roundtrip_trims_service() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            write_proxy_stream_header(&mut a, ProxyStreamKind::Udp, "  voice  ").await
        });

        let (kind, svc) = read_proxy_stream_header(&mut b).await.unwrap();
        assert_eq!(kind, ProxyStreamKind::Udp);
        assert_eq!(svc, "voice");
    }

    #[tokio::test]
    async fn proxy_header_rejects_empty_service() {
        let (mut a, _b) = tokio::io::duplex(128);
        assert!(matches!(
            write_proxy_stream_header(&mut a, ProxyStreamKind::Tcp, "  ").await,
            Err(ProtocolError::EmptyService)
        ));
    }
}
