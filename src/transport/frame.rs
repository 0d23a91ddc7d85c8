//! Length-prefixed frames: 4-byte little-endian length followed by the payload.

use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, ErrorKind, Read, Write};

/// Default upper bound (exclusive) of a frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 100 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    Closed,
    #[error("invalid frame length {0}")]
    InvalidLength(u32),
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("frame payload too large ({0} bytes)")]
    TooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Fill `buf` completely. Returns `false` on a clean EOF before the first byte.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read a single frame payload.
///
/// The length is validated against `0 < len < max_size` before anything is allocated.
pub fn read_frame(reader: &mut impl Read, max_size: u32) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    if !read_full(reader, &mut header)? {
        return Err(FrameError::Closed);
    }

    let len = (&header[..]).get_u32_le();
    if len == 0 || len >= max_size {
        return Err(FrameError::InvalidLength(len));
    }

    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Err(FrameError::Truncated);
    }
    Ok(payload)
}

/// Write a single frame and flush it.
pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(len);
    buf.put_slice(payload);

    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}
