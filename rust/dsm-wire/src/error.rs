use std::fmt;

use crate::MessageType;

/// Errors produced while encoding, decoding or transporting frames.
#[derive(Debug)]
pub enum WireError {
    /// The peer closed the stream before the first header byte.
    ConnectionClosed,
    /// The stream ended inside a header or body.
    Truncated,
    /// The type byte does not name a known message. The frame was consumed.
    InvalidMessage { kind: u8, sender: u8 },
    /// `total_length` is smaller than the header itself.
    BadLength(u8),
    /// A typed body does not match the layout of its message type.
    MalformedBody {
        kind: MessageType,
        reason: &'static str,
    },
    /// Caller tried to encode a body that does not fit in one frame.
    BodyTooLong { len: usize },
    /// A page chunk arrived for the wrong page or out of order.
    ChunkMismatch {
        page: u32,
        expected_offset: u32,
        got_page: u32,
        got_offset: u32,
    },
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl WireError {
    /// True when the stream can no longer be used.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            WireError::ConnectionClosed | WireError::Truncated | WireError::Io(_)
        )
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::ConnectionClosed => write!(f, "connection closed by peer"),
            WireError::Truncated => write!(f, "stream ended inside a frame"),
            WireError::InvalidMessage { kind, sender } => {
                write!(f, "invalid message type {} from sender {}", kind, sender)
            }
            WireError::BadLength(len) => {
                write!(f, "frame length {} is shorter than the header", len)
            }
            WireError::MalformedBody { kind, reason } => {
                write!(f, "malformed {} body: {}", kind, reason)
            }
            WireError::BodyTooLong { len } => {
                write!(
                    f,
                    "body of {} bytes exceeds the {} byte frame limit",
                    len,
                    crate::MAX_BODY_LEN
                )
            }
            WireError::ChunkMismatch {
                page,
                expected_offset,
                got_page,
                got_offset,
            } => write!(
                f,
                "expected chunk of page {} at offset {}, got page {} offset {}",
                page, expected_offset, got_page, got_offset
            ),
            WireError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}
