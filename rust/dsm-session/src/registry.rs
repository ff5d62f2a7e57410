//! Live worker connections, keyed by node id.
//!
//! Each connection gets a reader task that decodes frames into a per-node
//! channel. Receiving from a channel is cancel-safe, so the coordinator can
//! race every node's channel in [`ConnectionRegistry::next_ready`] and still
//! read a single node in order with [`ConnectionRegistry::recv_from`].

use std::collections::BTreeMap;
use std::fmt;

use dsm_wire::{Frame, Message, NodeId, WireError, read_frame, write_frame};
use futures_util::future::select_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::DsmError;

/// Frames buffered per connection before its reader task waits.
const INBOX_DEPTH: usize = 32;

type Inbound = Result<Frame, WireError>;

pub struct Connection {
    node: NodeId,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    inbox: mpsc::Receiver<Inbound>,
    reader: JoinHandle<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Take over a stream that has completed its handshake.
    pub fn new<S>(node: NodeId, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(node, reader, writer)
    }

    pub fn from_parts<R, W>(node: NodeId, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, inbox) = mpsc::channel(INBOX_DEPTH);
        let reader = tokio::spawn(read_loop(node, reader, tx));
        Self {
            node,
            writer: Box::new(writer),
            inbox,
            reader,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), DsmError> {
        let frame = message.to_frame(NodeId::ALLOCATOR);
        write_frame(&mut self.writer, &frame)
            .await
            .map_err(|e| DsmError::ConnectionLost {
                node: self.node,
                source: e,
            })
    }

    pub async fn recv(&mut self) -> Result<Message, DsmError> {
        let inbound = self.inbox.recv().await;
        decode(self.node, inbound)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(node: NodeId, mut reader: R, tx: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let result = read_frame(&mut reader).await;
        // unknown types leave the stream aligned; everything else ends it
        let keep_going = matches!(result, Ok(_) | Err(WireError::InvalidMessage { .. }));
        if let Err(e) = &result
            && !keep_going
        {
            tracing::debug!(node = %node, error = %e, "reader stopped");
        }
        if tx.send(result).await.is_err() || !keep_going {
            return;
        }
    }
}

fn decode(node: NodeId, inbound: Option<Inbound>) -> Result<Message, DsmError> {
    let frame = match inbound {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(DsmError::from_wire(node, e)),
        None => {
            return Err(DsmError::ConnectionLost {
                node,
                source: WireError::ConnectionClosed,
            });
        }
    };
    if frame.sender != node {
        return Err(DsmError::invalid(
            node,
            format!("{} claims to come from node {}", frame.kind, frame.sender),
        ));
    }
    Message::from_frame(&frame).map_err(|e| DsmError::from_wire(node, e))
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<NodeId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next registered node receives: the live count.
    pub fn next_id(&self) -> NodeId {
        NodeId(self.connections.len() as u8)
    }

    /// Add a connection under its node id.
    pub fn register(&mut self, connection: Connection) -> Result<NodeId, DsmError> {
        let node = connection.node();
        if self.connections.contains_key(&node) {
            return Err(DsmError::protocol(node, "node id is already registered"));
        }
        self.connections.insert(node, connection);
        tracing::debug!(node = %node, live = self.connections.len(), "registered");
        Ok(node)
    }

    /// Remove and close a connection.
    pub fn unregister(&mut self, node: NodeId) -> Option<Connection> {
        let removed = self.connections.remove(&node);
        if removed.is_some() {
            tracing::debug!(node = %node, live = self.connections.len(), "unregistered");
        }
        removed
    }

    pub fn get(&mut self, node: NodeId) -> Result<&mut Connection, DsmError> {
        self.connections.get_mut(&node).ok_or_else(|| DsmError::ConnectionLost {
            node,
            source: WireError::ConnectionClosed,
        })
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.connections.contains_key(&node)
    }

    pub fn iter_live(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.connections.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub async fn send(&mut self, node: NodeId, message: &Message) -> Result<(), DsmError> {
        self.get(node)?.send(message).await
    }

    /// Send the same message to every live node, in id order.
    pub async fn broadcast(&mut self, message: &Message) -> Result<(), DsmError> {
        for connection in self.connections.values_mut() {
            connection.send(message).await?;
        }
        Ok(())
    }

    /// Next message from one specific node.
    pub async fn recv_from(&mut self, node: NodeId) -> Result<Message, DsmError> {
        self.get(node)?.recv().await
    }

    /// Wait until at least one node has sent something, then take one
    /// message from every node that has one ready, in node order.
    ///
    /// A node with a backlog yields a single message per call, so it cannot
    /// hold back the others. Errors stay attached to their node so invalid
    /// traffic can be attributed and dropped.
    pub async fn next_ready(&mut self) -> Result<Vec<(NodeId, Result<Message, DsmError>)>, DsmError> {
        if self.connections.is_empty() {
            return Err(DsmError::protocol(None, "no live connections to wait on"));
        }
        let (first, inbound) = {
            let waits = self.connections.iter_mut().map(|(node, connection)| {
                let node = *node;
                Box::pin(async move { (node, connection.inbox.recv().await) })
            });
            let ((node, inbound), _, _) = select_all(waits).await;
            (node, inbound)
        };

        let mut woken = Some(inbound);
        let mut ready = Vec::with_capacity(self.connections.len());
        for (&node, connection) in self.connections.iter_mut() {
            let inbound = if node == first {
                woken.take().flatten()
            } else {
                match connection.inbox.try_recv() {
                    Ok(inbound) => Some(inbound),
                    Err(TryRecvError::Empty) => continue,
                    Err(TryRecvError::Disconnected) => None,
                }
            };
            ready.push((node, decode(node, inbound)));
        }
        Ok(ready)
    }
}
