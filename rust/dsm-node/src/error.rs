use std::fmt;

use dsm_wire::{FailCode, MessageType, WireError};

#[derive(Debug)]
pub enum NodeError {
    /// Framing or socket failure.
    Wire(WireError),
    /// The allocator answered with FAIL.
    Rejected { request: MessageType, code: FailCode },
    /// A reply of the wrong type arrived.
    UnexpectedReply {
        expected: MessageType,
        got: MessageType,
    },
    /// The connection to the allocator is gone.
    Closed,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Wire(e) => write!(f, "wire error: {}", e),
            NodeError::Rejected { request, code } => {
                write!(f, "allocator rejected {}: {}", request, code)
            }
            NodeError::UnexpectedReply { expected, got } => {
                write!(f, "expected {}, got {}", expected, got)
            }
            NodeError::Closed => write!(f, "connection to allocator closed"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for NodeError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ConnectionClosed | WireError::Truncated => NodeError::Closed,
            e => NodeError::Wire(e),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::from(WireError::from(e))
    }
}
