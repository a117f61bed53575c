//! Length-prefixed postcard framing.
//!
//! Data/ack frames: 4-byte big-endian header length, postcard header,
//! 8-byte big-endian payload length, payload bytes. Control frames are a
//! single length-prefixed postcard blob per direction.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;
use crate::message::DataHdr;

/// Maximum frame section size: 64 MiB. Payloads are slices or whole
/// objects; headers are small but a namespace inventory can be sizeable.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Write one data/ack frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    hdr: &DataHdr,
    payload: &[u8],
) -> Result<(), NetError> {
    let hdr_bytes =
        postcard::to_allocvec(hdr).map_err(|e| NetError::Serialization(e.to_string()))?;
    if hdr_bytes.len() > MAX_FRAME || payload.len() > MAX_FRAME {
        return Err(NetError::FrameTooLarge {
            len: hdr_bytes.len().max(payload.len()),
            max: MAX_FRAME,
        });
    }

    w.write_all(&(hdr_bytes.len() as u32).to_be_bytes()).await?;
    w.write_all(&hdr_bytes).await?;
    w.write_all(&(payload.len() as u64).to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read one data/ack frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(DataHdr, Bytes), NetError> {
    let mut len4 = [0u8; 4];
    r.read_exact(&mut len4).await?;
    let hdr_len = u32::from_be_bytes(len4) as usize;
    if hdr_len > MAX_FRAME {
        return Err(NetError::FrameTooLarge {
            len: hdr_len,
            max: MAX_FRAME,
        });
    }

    let mut hdr_bytes = vec![0u8; hdr_len];
    r.read_exact(&mut hdr_bytes).await?;
    let hdr: DataHdr =
        postcard::from_bytes(&hdr_bytes).map_err(|e| NetError::Serialization(e.to_string()))?;

    let mut len8 = [0u8; 8];
    r.read_exact(&mut len8).await?;
    let payload_len = u64::from_be_bytes(len8) as usize;
    if payload_len > MAX_FRAME {
        return Err(NetError::FrameTooLarge {
            len: payload_len,
            max: MAX_FRAME,
        });
    }

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await?;
    Ok((hdr, Bytes::from(payload)))
}

/// Write one control-plane blob.
pub async fn write_ctrl<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    msg: &T,
) -> Result<(), NetError> {
    let bytes = postcard::to_allocvec(msg).map_err(|e| NetError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_FRAME {
        return Err(NetError::FrameTooLarge {
            len: bytes.len(),
            max: MAX_FRAME,
        });
    }
    w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// Read one control-plane blob.
pub async fn read_ctrl<R: AsyncRead + Unpin, T: DeserializeOwned>(
    r: &mut R,
) -> Result<T, NetError> {
    let mut len4 = [0u8; 4];
    r.read_exact(&mut len4).await?;
    let len = u32::from_be_bytes(len4) as usize;
    if len > MAX_FRAME {
        return Err(NetError::FrameTooLarge {
            len,
            max: MAX_FRAME,
        });
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).await?;
    postcard::from_bytes(&bytes).map_err(|e| NetError::Serialization(e.to_string()))
}
