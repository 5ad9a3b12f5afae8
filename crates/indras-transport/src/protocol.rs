//! Stream header
//!
//! yamux streams carry no metadata, so the opener writes the protocol hint
//! as the first bytes of every stream:
//!
//! ```text
//! +-----------+------------------+
//! |  length   |  protocol hint   |
//! |  u16 (BE) |  UTF-8, <= 256   |
//! +-----------+------------------+
//! ```
//!
//! Application data follows immediately.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

/// Longest protocol hint a stream may carry
pub const MAX_PROTOCOL_LEN: usize = 256;

/// Write the protocol hint that opens a stream
pub async fn write_hint<W>(writer: &mut W, protocol: &str) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = protocol.len();
    if len > MAX_PROTOCOL_LEN {
        return Err(FramingError::MessageTooLarge {
            size: len,
            max: MAX_PROTOCOL_LEN,
        });
    }
    let mut buf = Vec::with_capacity(2 + len);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(protocol.as_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the protocol hint at the start of an inbound stream
///
/// The length is checked before the body is read, so an oversized hint
/// costs two bytes.
pub async fn read_hint<R>(reader: &mut R) -> Result<String, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = match reader.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::Closed);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_PROTOCOL_LEN {
        return Err(FramingError::MessageTooLarge {
            size: len,
            max: MAX_PROTOCOL_LEN,
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
    String::from_utf8(body).map_err(|e| FramingError::Deserialization(e.to_string()))
}
