//! Barrier and broadcast rendezvous.
//!
//! A [`Rendezvous`] is pure state: the coordinator feeds it every message it
//! reads while the collective is open and acts on the [`Observation`]. It
//! never performs I/O, so the coordinator can suspend between messages
//! instead of blocking inside a nested receive loop.

use std::collections::BTreeSet;
use std::fmt;

use dsm_wire::{Message, NodeId};

use crate::DsmError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectiveKind {
    Barrier,
    Broadcast { root: NodeId },
}

impl fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveKind::Barrier => write!(f, "barrier"),
            CollectiveKind::Broadcast { root } => write!(f, "broadcast from {}", root),
        }
    }
}

/// Outcome of feeding one message to a rendezvous.
#[derive(Debug, PartialEq, Eq)]
pub enum Observation {
    /// The sender has now reported in.
    Arrived,
    /// Ordinary traffic; dispatch it and keep waiting.
    Unrelated(Message),
}

#[derive(Debug)]
pub struct Rendezvous {
    kind: CollectiveKind,
    initiator: NodeId,
    awaiting: BTreeSet<NodeId>,
    captured: Option<u64>,
}

impl Rendezvous {
    /// Open a barrier started by `initiator` over `participants`.
    pub fn barrier(initiator: NodeId, participants: impl IntoIterator<Item = NodeId>) -> Self {
        Self::open(CollectiveKind::Barrier, initiator, participants)
    }

    /// Open a broadcast started by `initiator`, carrying `value` from it.
    ///
    /// The value is only kept when the initiator is the root; otherwise it
    /// is captured from the root's own CAST later.
    pub fn broadcast(
        initiator: NodeId,
        root: NodeId,
        value: u64,
        participants: impl IntoIterator<Item = NodeId>,
    ) -> Result<Self, DsmError> {
        let mut rendezvous = Self::open(CollectiveKind::Broadcast { root }, initiator, participants);
        if root == initiator {
            rendezvous.captured = Some(value);
        } else if !rendezvous.awaiting.contains(&root) {
            return Err(DsmError::protocol(
                initiator,
                format!("broadcast root {} is not a live node", root),
            ));
        }
        Ok(rendezvous)
    }

    fn open(kind: CollectiveKind, initiator: NodeId, participants: impl IntoIterator<Item = NodeId>) -> Self {
        let awaiting = participants.into_iter().filter(|n| *n != initiator).collect();
        Self {
            kind,
            initiator,
            awaiting,
            captured: None,
        }
    }

    pub fn kind(&self) -> CollectiveKind {
        self.kind
    }

    pub fn initiator(&self) -> NodeId {
        self.initiator
    }

    pub fn is_complete(&self) -> bool {
        self.awaiting.is_empty()
    }

    /// Nodes that have not reported in yet.
    pub fn waiting_on(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.awaiting.iter().copied()
    }

    /// Classify one message from `node`.
    pub fn observe(&mut self, node: NodeId, message: Message) -> Result<Observation, DsmError> {
        match (self.kind, message) {
            (CollectiveKind::Barrier, Message::Barrier) => {
                self.arrive(node)?;
                Ok(Observation::Arrived)
            }
            (CollectiveKind::Broadcast { root }, Message::Cast { root: theirs, value }) => {
                if theirs != root {
                    return Err(DsmError::protocol(
                        node,
                        format!("broadcast root {} does not match open broadcast from {}", theirs, root),
                    ));
                }
                self.arrive(node)?;
                if node == root {
                    self.captured = Some(value);
                }
                Ok(Observation::Arrived)
            }
            (kind, message @ (Message::Barrier | Message::Cast { .. })) => Err(DsmError::protocol(
                node,
                format!("{} while a {} is open", message.kind(), kind),
            )),
            (kind, Message::Exit) => Err(DsmError::protocol(
                node,
                format!("EXIT while a {} is open", kind),
            )),
            (_, message) => Ok(Observation::Unrelated(message)),
        }
    }

    fn arrive(&mut self, node: NodeId) -> Result<(), DsmError> {
        if self.awaiting.remove(&node) {
            tracing::debug!(node = %node, kind = %self.kind, remaining = self.awaiting.len(), "arrived");
            Ok(())
        } else {
            Err(DsmError::protocol(
                node,
                format!("node already reported in to the open {}", self.kind),
            ))
        }
    }

    /// The reply every participant receives once the rendezvous completes.
    pub fn release(&self) -> Result<Message, DsmError> {
        if !self.is_complete() {
            return Err(DsmError::protocol(
                None,
                format!("{} released with {} nodes outstanding", self.kind, self.awaiting.len()),
            ));
        }
        match self.kind {
            CollectiveKind::Barrier => Ok(Message::BarrierReply),
            CollectiveKind::Broadcast { root } => self
                .captured
                .map(|value| Message::CastReply { value })
                .ok_or_else(|| DsmError::protocol(root, "broadcast completed without a value from its root")),
        }
    }
}
