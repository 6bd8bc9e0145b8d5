use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
    time,
};

/// Reusable copy buffers, one size per pool.
///
/// Buffers whose capacity no longer matches the pool size (after a config
/// change) are dropped on release instead of being retained.
pub struct BufferPool {
    buf_size: usize,
    pool: Mutex<Vec<Vec<u8>>>,
}

const POOL_CAP: usize = 64;

impl BufferPool {
    pub fn new(buf_size: usize) -> Self {
        Self {
            buf_size: buf_size.max(1024),
            pool: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> Vec<u8> {
        if let Ok(mut p) = self.pool.lock() {
            if let Some(b) = p.pop() {
                return b;
            }
        }
        vec![0u8; self.buf_size]
    }

    fn release(&self, b: Vec<u8>) {
        if b.capacity() != self.buf_size {
            return;
        }
        if let Ok(mut p) = self.pool.lock() {
            if p.len() < POOL_CAP {
                p.push(b);
            }
        }
    }
}

/// Bidirectional byte bridge between a client and an upstream stream.
///
/// One task per direction with pooled buffers; the first error (or shutdown)
/// closes both sides and both copies are awaited before returning. Byte counts
/// are `(client_to_upstream, upstream_to_client)`.
pub struct Bridge {
    pool: Arc<BufferPool>,
    proxy_protocol_v2: bool,
}

impl Bridge {
    pub fn new(buffer_size: usize, proxy_protocol_v2: bool) -> Self {
        Self {
            pool: Arc::new(BufferPool::new(buffer_size)),
            proxy_protocol_v2,
        }
    }

    /// Write the proxy-protocol v2 preamble for `src -> dst` if enabled.
    pub async fn write_preamble<W: AsyncWrite + Unpin>(
        &self,
        upstream: &mut W,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> io::Result<()> {
        if !self.proxy_protocol_v2 {
            return Ok(());
        }
        let hdr = proxy_protocol_v2_header(src, dst);
        upstream.write_all(&hdr).await?;
        upstream.flush().await
    }

    pub async fn run<A, B>(
        &self,
        client: A,
        upstream: B,
        idle_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<(u64, u64)>
    where
        A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (cr, cw) = tokio::io::split(client);
        let (ur, uw) = tokio::io::split(upstream);

        let (cancel_tx, cancel_rx) = watch::channel(false);

        let up = tokio::spawn(copy_half(
            cr,
            uw,
            self.pool.clone(),
            idle_timeout,
            cancel_tx.clone(),
            cancel_rx.clone(),
            shutdown.clone(),
        ));
        let down = tokio::spawn(copy_half(
            ur,
            cw,
            self.pool.clone(),
            idle_timeout,
            cancel_tx,
            cancel_rx,
            shutdown,
        ));

        let (a, b) = match tokio::join!(up, down) {
            (Ok(a), Ok(b)) => (a, b),
            _ => {
                return Err(io::Error::other("bridge: copy task panicked"));
            }
        };

        let (ingress, err_a) = a;
        let (egress, err_b) = b;
        if let Some(e) = err_a.or(err_b) {
            return Err(e);
        }
        Ok((ingress, egress))
    }
}

async fn copy_half<R, W>(
    mut r: R,
    mut w: W,
    pool: Arc<BufferPool>,
    idle_timeout: Duration,
    cancel_tx: watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.acquire();
    let mut copied: u64 = 0;
    let mut err: Option<io::Error> = None;

    loop {
        let read = async {
            if idle_timeout > Duration::from_millis(0) {
                match time::timeout(idle_timeout, r.read(&mut buf)).await {
                    Ok(res) => res,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                }
            } else {
                r.read(&mut buf).await
            }
        };

        let n = tokio::select! {
            biased;
            _ = watch_true(&mut cancel_rx) => break,
            _ = watch_true(&mut shutdown) => {
                let _ = cancel_tx.send(true);
                break;
            }
            res = read => match res {
                Ok(0) => {
                    // Clean half-close: propagate EOF, let the peer direction drain.
                    let _ = w.shutdown().await;
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    err = Some(e);
                    let _ = cancel_tx.send(true);
                    break;
                }
            }
        };

        if let Err(e) = w.write_all(&buf[..n]).await {
            err = Some(e);
            let _ = cancel_tx.send(true);
            break;
        }
        copied += n as u64;
    }

    let _ = w.shutdown().await;
    pool.release(buf);

    // Errors caused by the other side tearing the connection down after cancel
    // are part of a normal close.
    if *cancel_rx.borrow() {
        if let Some(e) = &err {
            if matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::NotConnected
            ) {
                err = None;
            }
        }
    }

    (copied, err)
}

/// Resolve once the watched flag turns true. A closed channel parks forever:
/// a vanished sender means that signal can no longer fire.
async fn watch_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Proxy-protocol v2 header for a proxied TCP connection.
///
/// IPv4 pairs produce exactly 28 bytes, IPv6 pairs 52; a mixed pair degrades
/// to the 16-byte UNSPEC form.
pub fn proxy_protocol_v2_header(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    const SIG: [u8; 12] = [
        0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
    ];

    let mut out = Vec::with_capacity(52);
    out.extend_from_slice(&SIG);
    // ver=2 | cmd=PROXY
    out.push(0x21);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(sip), IpAddr::V4(dip)) => {
            // fam=INET | proto=STREAM
            out.push(0x11);
            out.extend_from_slice(&12u16.to_be_bytes());
            out.extend_from_slice(&sip.octets());
            out.extend_from_slice(&dip.octets());
            out.extend_from_slice(&src.port().to_be_bytes());
            out.extend_from_slice(&dst.port().to_be_bytes());
        }
        (IpAddr::V6(sip), IpAddr::V6(dip)) => {
            // fam=INET6 | proto=STREAM
            out.push(0x21);
            out.extend_from_slice(&36u16.to_be_bytes());
            out.extend_from_slice(&sip.octets());
            out.extend_from_slice(&dip.octets());
            out.extend_from_slice(&src.port().to_be_bytes());
            out.extend_from_slice(&dst.port().to_be_bytes());
        }
        _ => {
            out.push(0x00);
            out.extend_from_slice(&0u16.to_be_bytes());
        }
    }

    out
}
