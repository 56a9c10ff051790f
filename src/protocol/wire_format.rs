//! Wire format encoding and decoding.
//!
//! Every message on the store socket is a length prefix followed by the
//! message bytes:
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length           │ Message (JSON)           │
//! │ 8 bytes, u64 LE  │ `Length` bytes           │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! The prefix is the store's native `size_t`, which is little endian on every
//! platform the store runs on.
//!
//! The helpers here are generic over tokio's async I/O traits so the same
//! framing drives the real socket and in-memory pipes in tests.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StoreError};

/// Length prefix size in bytes (fixed, exactly 8).
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Default maximum message size (64 MB).
///
/// Messages only carry metadata and payload descriptors, never blob bytes,
/// so anything near this limit means the stream is out of sync.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Encode a message length as the wire prefix.
#[inline]
pub fn encode_length(len: usize) -> [u8; LENGTH_PREFIX_SIZE] {
    (len as u64).to_le_bytes()
}

/// Decode a wire prefix into a message length.
#[inline]
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> u64 {
    u64::from_le_bytes(prefix)
}

/// Build a complete framed message as a single byte vector.
///
/// # Example
///
/// ```
/// use shm_store_client::protocol::{frame_message, LENGTH_PREFIX_SIZE};
///
/// let bytes = frame_message(b"{}");
/// assert_eq!(bytes.len(), LENGTH_PREFIX_SIZE + 2);
/// assert_eq!(bytes[0], 2);
/// ```
pub fn frame_message(message: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + message.len());
    buf.extend_from_slice(&encode_length(message.len()));
    buf.extend_from_slice(message);
    buf
}

/// Write one framed message.
///
/// Prefix and body go out in a single `write_all` so a writer holding the
/// connection never leaves a half-written frame behind another.
pub async fn write_message<W>(writer: &mut W, message: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame_message(message)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one framed message.
///
/// Reads never go past the end of the message, which keeps any descriptor
/// that follows it on the socket untouched.
///
/// # Errors
///
/// Returns [`StoreError::ConnectionCorrupted`] if the announced length exceeds
/// `max_message_size`, and [`StoreError::Io`] on EOF or socket failure.
pub async fn read_message<R>(reader: &mut R, max_message_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;

    let len = decode_length(prefix);
    if len > max_message_size as u64 {
        return Err(StoreError::ConnectionCorrupted(format!(
            "message size {} exceeds maximum {}",
            len, max_message_size
        )));
    }

    let mut buf = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}
