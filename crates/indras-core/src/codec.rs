//! Length-prefixed postcard framing
//!
//! Every control message in the stack (handshake, relay hop/stop,
//! hole-punch signaling) travels as a 4-byte big-endian length followed by
//! a postcard body.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

/// Maximum encoded frame body (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Serialize a message with its length prefix
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Bytes, FramingError> {
    let serialized =
        postcard::to_allocvec(msg).map_err(|e| FramingError::Serialization(e.to_string()))?;

    if serialized.len() > MAX_FRAME_SIZE {
        return Err(FramingError::MessageTooLarge {
            size: serialized.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = serialized.len() as u32;
    let mut framed = Vec::with_capacity(4 + serialized.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&serialized);

    Ok(Bytes::from(framed))
}

/// Parse one complete frame from a buffer
pub fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> Result<T, FramingError> {
    if data.len() < 4 {
        return Err(FramingError::InsufficientData {
            needed: 4,
            available: data.len(),
        });
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FramingError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if data.len() < 4 + len {
        return Err(FramingError::InsufficientData {
            needed: 4 + len,
            available: data.len(),
        });
    }

    postcard::from_bytes(&data[4..4 + len])
        .map_err(|e| FramingError::Deserialization(e.to_string()))
}

/// Write one framed message and flush
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let framed = encode_frame(msg)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message
///
/// A clean end of stream before the length prefix yields [`FramingError::Closed`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::Closed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FramingError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FramingError::Closed
        } else {
            FramingError::Io(e)
        }
    })?;

    postcard::from_bytes(&body).map_err(|e| FramingError::Deserialization(e.to_string()))
}
