//! Framing shared by every buffer streamed between processes: a 4-byte
//! big-endian length followed by a JSON metadata object, then packets with a
//! 1-byte tag and a 4-byte big-endian payload length.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const TAG_DATA: u8 = b'd';
pub const TAG_ERROR: u8 = b'e';

const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, PartialEq)]
pub enum Packet {
    Data(Bytes),
    Error(String),
}

pub async fn write_meta<T: Serialize>(
    w: &mut (dyn AsyncWrite + Send + Unpin),
    meta: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(meta)?;
    w.write_u32(u32::try_from(bytes.len())?).await?;
    w.write_all(&bytes).await?;
    Ok(())
}

pub async fn read_meta<T, R>(r: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + ?Sized,
{
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("metadata frame of {} bytes is too large", len));
    }
    let mut buf = vec![0; len];
    r.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

pub async fn write_packet(
    w: &mut (dyn AsyncWrite + Send + Unpin),
    tag: u8,
    payload: &[u8],
) -> Result<()> {
    w.write_u8(tag).await?;
    w.write_u32(u32::try_from(payload.len())?).await?;
    w.write_all(payload).await?;
    Ok(())
}

/// Next packet, or `None` at a clean end of stream between packets.
pub async fn read_packet<R>(r: &mut R) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = match r.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("packet of {} bytes is too large", len));
    }
    let mut payload = vec![0; len];
    r.read_exact(&mut payload).await?;
    match tag {
        TAG_DATA => Ok(Some(Packet::Data(payload.into()))),
        TAG_ERROR => Ok(Some(Packet::Error(
            String::from_utf8_lossy(&payload).into_owned(),
        ))),
        other => Err(anyhow!("unknown packet tag {:#04x}", other)),
    }
}
