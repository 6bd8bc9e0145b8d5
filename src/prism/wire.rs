//! VarInt and length-prefixed string codecs shared by the Minecraft handshake
//! parser and the tunnel wire protocol.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest legal VarInt encoding of an i32.
pub const MAX_VARINT_BYTES: usize = 5;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("varint too long")]
    VarIntTooLong,
    #[error("negative length")]
    NegativeLength,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode a VarInt starting at `buf[at]`.
///
/// Returns `(value, bytes_consumed)`, or `None` when the slice ends before the
/// varint terminates or the encoding exceeds five bytes.
pub fn get_varint(buf: &[u8], at: usize) -> Option<(i32, usize)> {
    let mut i = at;
    let mut shift = 0u32;
    let mut out: i32 = 0;

    loop {
        let b = *buf.get(i)?;
        i += 1;
        if shift > 28 {
            // A sixth byte can never be part of a valid i32 varint.
            return None;
        }
        out |= ((b & 0x7F) as i32) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    Some((out, i - at))
}

pub fn put_varint(out: &mut Vec<u8>, mut v: i32) {
    loop {
        let mut b = (v & 0x7F) as u8;
        v = ((v as u32) >> 7) as i32;
        if v != 0 {
            b |= 0x80;
        }
        out.push(b);
        if v == 0 {
            break;
        }
    }
}

/// Append a VarInt-length-prefixed UTF-8 string.
pub fn put_string(out: &mut Vec<u8>, s: &str) {
    put_varint(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

pub async fn write_varint<W: AsyncWrite + Unpin>(w: &mut W, mut v: i32) -> Result<(), WireError> {
    loop {
        let mut b = (v & 0x7F) as u8;
        v = ((v as u32) >> 7) as i32;
        if v != 0 {
            b |= 0x80;
        }
        w.write_u8(b).await?;
        if v == 0 {
            break;
        }
    }
    Ok(())
}

pub async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<i32, WireError> {
    let mut shift = 0u32;
    let mut out: i32 = 0;
    loop {
        let b = r.read_u8().await?;
        if shift > 28 {
            return Err(WireError::VarIntTooLong);
        }
        out |= ((b & 0x7F) as i32) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(out)
}

pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<(), WireError> {
    write_varint(w, s.len() as i32).await?;
    w.write_all(s.as_bytes()).await?;
    Ok(())
}

pub async fn read_string<R: AsyncRead + Unpin>(
    r: &mut R,
    max_len: usize,
) -> Result<String, WireError> {
    let len = read_varint(r).await?;
    if len < 0 {
        return Err(WireError::NegativeLength);
    }
    let len = len as usize;
    if len > max_len {
        return Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("string too long ({len} > {max_len})"),
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
