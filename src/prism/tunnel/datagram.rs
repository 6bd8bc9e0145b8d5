use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::prism::tunnel::protocol::{MAX_DATAGRAM_BYTES, ProtocolError};

/// Datagram framing over a tunnel stream: `u32be len | payload`.
///
/// Used to carry UDP through the stream-oriented tunnel while preserving
/// message boundaries. `split` yields independent read/write halves so the
/// two relay directions can run as separate tasks; a frame read must never
/// be cancelled midway.
pub struct DatagramConn<RW> {
    inner: RW,
}

pub struct DatagramReader<R> {
    inner: R,
}

pub struct DatagramWriter<W> {
    inner: W,
}

impl<RW> DatagramConn<RW> {
    pub fn new(inner: RW) -> Self {
        Self { inner }
    }
}

impl<RW> DatagramConn<RW>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn read_datagram(&mut self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        read_frame(&mut self.inner, out).await
    }

    pub async fn write_datagram(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        write_frame(&mut self.inner, payload).await
    }

    pub fn split(
        self,
    ) -> (
        DatagramReader<tokio::io::ReadHalf<RW>>,
        DatagramWriter<tokio::io::WriteHalf<RW>>,
    ) {
        let (r, w) = tokio::io::split(self.inner);
        (DatagramReader { inner: r }, DatagramWriter { inner: w })
    }
}

impl<R> DatagramReader<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn read_datagram(&mut self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        read_frame(&mut self.inner, out).await
    }
}

impl<W> DatagramWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub async fn write_datagram(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        write_frame(&mut self.inner, payload).await
    }
}

async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    out: &mut [u8],
) -> Result<usize, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let n = n as usize;
    if n > out.len() {
        // Drain the frame so the stream stays aligned.
        let mut sink = vec![0u8; n];
        r.read_exact(&mut sink).await?;
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "datagram larger than buffer",
        )));
    }
    r.read_exact(&mut out[..n]).await?;
    Ok(n)
}

async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let n: u32 = payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagram_roundtrip_preserves_boundaries() {
        let (a, b) = tokio::io::duplex(4096);
        let mut wr = DatagramConn::new(a);
        let mut rd = DatagramConn::new(b);

        wr.write_datagram(b"one").await.unwrap();
        wr.write_datagram(b"twotwo").await.unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(rd.read_datagram(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"one");
        assert_eq!(rd.read_datagram(&mut buf).await.unwrap(), 6);
        assert_eq!(&buf[..6], b"twotwo");
    }

    #[tokio::test]
    async fn oversized_datagram_keeps_stream_aligned() {
        let (a, b) = tokio::io::duplex(4096);
        let mut wr = DatagramConn::new(a);
        let mut rd = DatagramConn::new(b);

        wr.write_datagram(&[7u8; 32]).await.unwrap();
        wr.write_datagram(b"after").await.unwrap();

        let mut small = [0u8; 8];
        assert!(rd.read_datagram(&mut small).await.is_err());
        let mut buf = [0u8; 64];
        assert_eq!(rd.read_datagram(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"after");
    }

    #[tokio::test]
    async fn split_halves_frame_independently() {
        let (a, b) = tokio::io::duplex(4096);
        let (_rd_a, mut wr_a) = DatagramConn::new(a).split();
        let (mut rd_b, _wr_b) = DatagramConn::new(b).split();

        wr_a.write_datagram(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(rd_b.read_datagram(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }
}
