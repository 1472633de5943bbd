//! Frame I/O over async byte streams.
//!
//! The byte layout lives in `switchboard_wire`; this module only knows how to
//! pull one length-prefixed frame off a reader and push one onto a writer.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use switchboard_wire::{DecodeError, FRAME_HEADER_LEN, Message, decode_body};

use crate::error::FrameError;

/// Frame size limit for clients, matching the server's default.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Bodies are buffered at most this far ahead of the bytes actually received.
const BODY_CHUNK: usize = 64 * 1024;

/// Read one frame and decode it.
///
/// Returns `None` if the peer closed the stream cleanly on a frame boundary.
/// EOF anywhere inside a frame is a decode error. Frames declaring more than
/// `max_frame_bytes` are rejected before their body is read.
pub async fn read_message<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    let got = fill(reader, &mut len_buf).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < FRAME_HEADER_LEN {
        return Err(DecodeError::TruncatedPrefix { available: got }.into());
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(DecodeError::FrameTooLarge {
            len,
            max: max_frame_bytes,
        }
        .into());
    }

    let mut body = BytesMut::with_capacity(len.min(BODY_CHUNK));
    read_body(reader, len, &mut body).await?;
    if body.len() < len {
        return Err(DecodeError::Truncated {
            field: "body",
            needed: len,
            remaining: body.len(),
        }
        .into());
    }
    Ok(Some(decode_body(body.freeze())?))
}

/// Write one already-encoded frame (length prefix included).
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Append up to `len` bytes of body, stopping early at EOF.
///
/// The buffer grows with what has arrived, so a peer that declares a large
/// frame and then stalls pins at most one chunk beyond what it sent.
async fn read_body<R>(reader: &mut R, len: usize, body: &mut BytesMut) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while body.len() < len {
        let want = (len - body.len()).min(BODY_CHUNK);
        body.reserve(want);
        let n = (&mut *reader).take(want as u64).read_buf(body).await?;
        if n == 0 {
            break;
        }
    }
    Ok(())
}

/// Read until `buf` is full or the stream ends. Returns the bytes read.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
