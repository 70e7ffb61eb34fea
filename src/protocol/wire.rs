//! Length-prefixed framing
//!
//! Every frame on the channel is `u32 big-endian length || payload`. The reader refuses
//! frames above a fixed cap before buffering any of the payload.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

/// Largest payload accepted from the peer (50 MiB)
pub const MAX_FRAME_BYTES: usize = 50 * 1024 * 1024;

/// Channel-level faults. Any of these ends the read loop.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },

    #[error("frame truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Reads frames from a byte stream
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader with the default frame cap
    #[cfg(test)]
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_BYTES)
    }

    /// Create a reader with a custom frame cap
    pub fn with_limit(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            max_frame_bytes,
        }
    }

    /// Read the next frame payload.
    ///
    /// Returns `Ok(None)` when the stream ends before a complete length prefix.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut len_buf = [0u8; 4];
        let got = read_full(&mut self.inner, &mut len_buf)?;
        if got < len_buf.len() {
            if got > 0 {
                debug!("stream closed inside a length prefix ({} of 4 bytes)", got);
            }
            return Ok(None);
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_bytes {
            return Err(FrameError::Oversized {
                len,
                max: self.max_frame_bytes,
            });
        }

        let mut payload = vec![0u8; len];
        let received = read_full(&mut self.inner, &mut payload)?;
        if received < len {
            return Err(FrameError::Truncated {
                expected: len,
                received,
            });
        }

        Ok(Some(payload))
    }
}

/// Write one frame and flush it
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Fill `buf` as far as the stream allows; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
