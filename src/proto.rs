//! Wire format for log replication.
//!
//! Frames are length-prefixed, postcard-encoded. Entries travel inside
//! frames as their canonical JSON bytes, so the content address a receiver
//! computes is over exactly the bytes the sender hashed.

use std::io;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::log::EntryId;

/// Maximum size of a single replication frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A replication protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Ids of all entries the sender currently stores.
    ///
    /// Sent once when a session starts; the receiver answers with every
    /// entry the sender lacks.
    Have(Vec<EntryId>),
    /// One log entry, as its canonical JSON encoding.
    Entry(Vec<u8>),
}

/// Error while encoding, decoding or transporting a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),
    #[error("malformed frame: {0}")]
    Codec(#[from] postcard::Error),
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let data = postcard::to_stdvec(frame)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(data.len()));
    }
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame.
///
/// Returns `None` on a clean end of stream (no partial frame).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<Frame>, FrameError> {
    match read_lp(reader, buffer).await? {
        None => Ok(None),
        Some(data) => Ok(Some(postcard::from_bytes(&data)?)),
    }
}

/// Read one length-prefixed message as raw bytes.
async fn read_lp<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<Bytes>, FrameError> {
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(size));
    }
    buffer.reserve(size);
    let mut take = reader.take(size as u64);
    while buffer.len() < size {
        let n = take.read_buf(buffer).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame").into());
        }
    }
    Ok(Some(buffer.split_to(size).freeze()))
}
