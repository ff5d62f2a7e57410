//! Message routing.
//!
//! [`route`] turns a decoded request into the handler that must run it. It
//! touches no state; the coordinator owns every handler.

use std::fmt;

use dsm_wire::{Message, NodeId};

use crate::{DsmError, FaultKind};

/// Handler selected for a worker request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// EXIT: acknowledge and unregister.
    Close,
    /// BARR: start or join a barrier.
    Barrier,
    /// CAST: start or join a broadcast.
    Broadcast { root: NodeId, value: u64 },
    /// ALOC
    Allocate { size: u32 },
    /// READ_FAULT / WRITE_FAULT
    Fault { kind: FaultKind, offset: u64 },
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Close => write!(f, "close"),
            Route::Barrier => write!(f, "barrier"),
            Route::Broadcast { root, .. } => write!(f, "broadcast from {}", root),
            Route::Allocate { size } => write!(f, "allocate {} bytes", size),
            Route::Fault { kind, offset } => write!(f, "{} fault @ {}", kind, offset),
        }
    }
}

/// Pick the handler for a request from `node`.
///
/// Anything a worker is not allowed to send once registered (a second INIT,
/// allocator-side replies, stray page traffic) is
/// [`DsmError::InvalidMessage`].
pub fn route(node: NodeId, message: &Message) -> Result<Route, DsmError> {
    Ok(match *message {
        Message::Exit => Route::Close,
        Message::Barrier => Route::Barrier,
        Message::Cast { root, value } => Route::Broadcast { root, value },
        Message::Alloc { size } => Route::Allocate { size },
        Message::ReadFault { offset } => Route::Fault {
            kind: FaultKind::Read,
            offset,
        },
        Message::WriteFault { offset } => Route::Fault {
            kind: FaultKind::Write,
            offset,
        },
        ref other => return Err(DsmError::unexpected(node, other.kind())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsm_wire::{MessageType, PageAccess};

    #[test]
    fn worker_requests_have_routes() {
        let node = NodeId(0);
        assert_eq!(route(node, &Message::Exit).unwrap(), Route::Close);
        assert_eq!(route(node, &Message::Barrier).unwrap(), Route::Barrier);
        assert_eq!(
            route(node, &Message::Alloc { size: 64 }).unwrap(),
            Route::Allocate { size: 64 }
        );
        assert_eq!(
            route(node, &Message::WriteFault { offset: 9 }).unwrap(),
            Route::Fault {
                kind: FaultKind::Write,
                offset: 9
            }
        );
        let cast = Message::Cast {
            root: NodeId(2),
            value: 5,
        };
        assert_eq!(
            route(node, &cast).unwrap(),
            Route::Broadcast {
                root: NodeId(2),
                value: 5
            }
        );
    }

    #[test]
    fn allocator_side_messages_are_invalid() {
        let node = NodeId(1);
        for message in [
            Message::Init,
            Message::BarrierReply,
            Message::AllocReply { offset: 0 },
            Message::PageRequest {
                page: 0,
                access: PageAccess::Share,
            },
            Message::InvalidateReply { page: 0 },
        ] {
            let err = route(node, &message).unwrap_err();
            assert!(!err.is_fatal(), "{} should be droppable", message.kind());
        }
        let fail = Message::Fail {
            request: MessageType::Alloc,
            code: dsm_wire::FailCode::OutOfPages,
        };
        assert!(route(node, &fail).is_err());
    }
}
