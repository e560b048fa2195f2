//! Frame codec — 4-byte big-endian length prefix, then that many payload bytes.
//!
//! One frame carries one envelope (plaintext during the handshake, sealed
//! afterwards). The length prefix is the only wire structure below the
//! envelope layer; changing the prefix width or the payload cap is a
//! protocol-breaking change.
//!
//! A clean close is only legal between frames. EOF inside the length prefix
//! or inside the payload is a protocol error, not a close.

use std::io::{Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload in bytes. Oversize frames are a fatal protocol error.
pub const MAX_FRAME: usize = 65_536;

/// Width of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Errors that can arise while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds maximum {MAX_FRAME}")]
    Oversize(usize),

    #[error("stream ended mid-frame")]
    Truncated,

    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one frame from `stream`.
///
/// Returns `Ok(None)` on a clean close (EOF exactly between frames).
/// EOF anywhere inside a frame is [`FrameError::Truncated`].
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<Vec<u8>>, FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = stream.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(FrameError::Oversize(len));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

/// Write one frame to `stream` and flush it.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME {
        return Err(FrameError::Oversize(payload.len()));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Blocking variant of [`read_frame`] for frame-formatted files
/// (the client history file reuses this record format).
pub fn read_frame_sync<S: Read>(stream: &mut S) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_buf = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = stream.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(FrameError::Oversize(len));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

/// Blocking variant of [`write_frame`].
pub fn write_frame_sync<S: Write>(stream: &mut S, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME {
        return Err(FrameError::Oversize(payload.len()));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}
