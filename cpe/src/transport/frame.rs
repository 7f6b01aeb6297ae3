//! Length-prefixed framing for the fenced worker protocol.
//!
//! Every message is one frame: a `u32` big-endian length `N` counting the
//! bytes after the length field, a one-byte [`FrameKind`], and `N - 1` payload
//! bytes. Frames larger than [`MAX_FRAME_SIZE`] are rejected on both ends.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Upper bound on `N`.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Version carried in the `Hello` payload.
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    // Requests
    Hello = 0x01,
    Process = 0x02,
    GetMetaData = 0x03,
    BatchComplete = 0x04,
    CollectionComplete = 0x05,

    // Responses
    Ack = 0x81,
    Processed = 0x82,
    MetaData = 0x83,
    Error = 0xE0,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::Hello,
            0x02 => Self::Process,
            0x03 => Self::GetMetaData,
            0x04 => Self::BatchComplete,
            0x05 => Self::CollectionComplete,
            0x81 => Self::Ack,
            0x82 => Self::Processed,
            0x83 => Self::MetaData,
            0xE0 => Self::Error,
            _ => return None,
        })
    }

    pub fn is_request(self) -> bool {
        (self as u8) < 0x80
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: FrameKind) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn hello() -> Self {
        Self::new(FrameKind::Hello, PROTOCOL_VERSION.to_be_bytes().to_vec())
    }

    pub fn error(message: impl AsRef<str>) -> Self {
        Self::new(FrameKind::Error, message.as_ref().as_bytes().to_vec())
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        4 + 1 + self.payload.len()
    }

    /// Payload interpreted as UTF-8 text, lossily.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge { size: usize },

    #[error("Zero-length frame")]
    Empty,

    #[error("Unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let len = frame.payload.len() + 1;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { size: len });
    }

    let mut buf = Vec::with_capacity(frame.wire_len());
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.push(frame.kind as u8);
    buf.extend_from_slice(&frame.payload);

    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame.
///
/// The whole frame is consumed before the kind is validated, so an unknown
/// kind leaves the stream positioned at the next frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;

    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { size: len });
    }

    let mut kind = [0u8; 1];
    reader.read_exact(&mut kind)?;
    let mut payload = vec![0u8; len - 1];
    reader.read_exact(&mut payload)?;

    let kind = FrameKind::from_byte(kind[0]).ok_or(FrameError::UnknownKind(kind[0]))?;
    Ok(Frame::new(kind, payload))
}
