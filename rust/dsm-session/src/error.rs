use std::fmt;
use std::time::Duration;

use dsm_wire::{MessageType, NodeId, WireError};

/// Errors raised by the allocator session.
///
/// Only [`DsmError::InvalidMessage`] is survivable while serving; everything
/// else ends the run (see [`DsmError::is_fatal`]).
#[derive(Debug)]
pub enum DsmError {
    /// Malformed or out-of-sequence traffic, e.g. a first message that is not INIT.
    ProtocolViolation { node: Option<NodeId>, reason: String },
    /// The peer closed its connection or the socket failed mid-exchange.
    ConnectionLost { node: NodeId, source: WireError },
    /// The page table has no unused page left.
    OutOfPages { max_pages: u32 },
    /// The page lacks room for the requested size. Handled internally by
    /// moving to a fresh page.
    PageFull { page: u32, requested: u32 },
    /// A message with an unknown type, a malformed body, or a type the
    /// allocator never accepts from workers.
    InvalidMessage { node: NodeId, reason: String },
    /// A blocking collective or fault wait exceeded the configured deadline.
    Timeout { waiting_on: String, after: Duration },
    /// Rejected configuration.
    Config(String),
    /// Listener or socket setup failure.
    Io(std::io::Error),
}

impl DsmError {
    pub fn protocol(node: impl Into<Option<NodeId>>, reason: impl Into<String>) -> Self {
        DsmError::ProtocolViolation {
            node: node.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(node: NodeId, reason: impl Into<String>) -> Self {
        DsmError::InvalidMessage {
            node,
            reason: reason.into(),
        }
    }

    /// Map a wire error seen on `node`'s connection.
    pub fn from_wire(node: NodeId, err: WireError) -> Self {
        match err {
            WireError::InvalidMessage { kind, .. } => {
                DsmError::invalid(node, format!("unknown message type {}", kind))
            }
            WireError::MalformedBody { kind, reason } => {
                DsmError::invalid(node, format!("malformed {} body: {}", kind, reason))
            }
            err => DsmError::ConnectionLost { node, source: err },
        }
    }

    pub fn unexpected(node: NodeId, kind: MessageType) -> Self {
        DsmError::invalid(node, format!("{} is not a request the allocator accepts", kind))
    }

    /// Whether this error ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DsmError::InvalidMessage { .. })
    }
}

impl fmt::Display for DsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsmError::ProtocolViolation {
                node: Some(node),
                reason,
            } => write!(f, "protocol violation by node {}: {}", node, reason),
            DsmError::ProtocolViolation { node: None, reason } => {
                write!(f, "protocol violation: {}", reason)
            }
            DsmError::ConnectionLost { node, source } => {
                write!(f, "lost connection to node {}: {}", node, source)
            }
            DsmError::OutOfPages { max_pages } => {
                write!(f, "all {} pages are allocated", max_pages)
            }
            DsmError::PageFull { page, requested } => {
                write!(f, "page {} has no room for {} bytes", page, requested)
            }
            DsmError::InvalidMessage { node, reason } => {
                write!(f, "invalid message from node {}: {}", node, reason)
            }
            DsmError::Timeout { waiting_on, after } => {
                write!(f, "timed out after {:?} waiting on {}", after, waiting_on)
            }
            DsmError::Config(reason) => write!(f, "invalid configuration: {}", reason),
            DsmError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for DsmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DsmError::ConnectionLost { source, .. } => Some(source),
            DsmError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DsmError {
    fn from(e: std::io::Error) -> Self {
        DsmError::Io(e)
    }
}
