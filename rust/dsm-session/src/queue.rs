use std::collections::VecDeque;

use dsm_wire::{Message, NodeId};

/// Requests read while a collective or fault wait was in flight.
///
/// Strict FIFO across all nodes, which keeps every node's own requests in
/// the order it sent them. The coordinator always empties this queue before
/// reading anything new from a connection.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<(NodeId, Message)>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: NodeId, message: Message) {
        tracing::trace!(node = %node, kind = %message.kind(), depth = self.entries.len() + 1, "request queued");
        self.entries.push_back((node, message));
    }

    pub fn pop(&mut self) -> Option<(NodeId, Message)> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of queued requests from `node`.
    pub fn queued_for(&self, node: NodeId) -> usize {
        self.entries.iter().filter(|(n, _)| *n == node).count()
    }
}
