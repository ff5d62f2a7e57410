use std::sync::Arc;

use bytes::Bytes;
use dsm_wire::{
    Message, MessageType, NodeId, PageAccess, PageAssembler, PageChunk, WireError, read_frame,
    split_page, write_frame,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

use crate::{Access, NodeError, Region};

type SharedWriter = Arc<AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>>;

/// A worker's connection to the allocator.
///
/// Calls are sequential: each request waits for its reply before the next
/// one is sent, like a single-threaded worker process would.
pub struct Node {
    id: NodeId,
    total_nodes: u8,
    page_size: u32,
    max_pages: u32,
    writer: SharedWriter,
    replies: mpsc::UnboundedReceiver<Result<Message, WireError>>,
    region: Arc<Mutex<Region>>,
    agent: JoinHandle<()>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("total_nodes", &self.total_nodes)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, NodeError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream).await
    }

    /// Register over an already-open stream.
    pub async fn handshake<S>(mut stream: S) -> Result<Self, NodeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // no id yet; the allocator ignores the sender byte on INIT
        write_frame(&mut stream, &Message::Init.to_frame(NodeId(0))).await?;
        let frame = read_frame(&mut stream).await?;
        let (id, total_nodes, page_size, max_pages) = match Message::from_frame(&frame)? {
            Message::InitReply {
                node_id,
                total_nodes,
                page_size,
                max_pages,
            } => (node_id, total_nodes, page_size, max_pages),
            other => return Err(unexpected(MessageType::InitReply, &other)),
        };

        let (reader, writer) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(AsyncMutex::new(Box::new(writer)));
        let region = Arc::new(Mutex::new(Region::new(page_size)));
        let (tx, replies) = mpsc::unbounded_channel();
        let agent = Agent {
            id,
            reader,
            writer: writer.clone(),
            region: region.clone(),
            replies: tx,
            incoming: None,
        };
        let agent = tokio::spawn(agent.run());
        tracing::debug!(node = %id, total_nodes, page_size, "registered with allocator");

        Ok(Self {
            id,
            total_nodes,
            page_size,
            max_pages,
            writer,
            replies,
            region,
            agent,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn total_nodes(&self) -> u8 {
        self.total_nodes
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Size of the shared address space in bytes.
    pub fn region_len(&self) -> u64 {
        self.page_size as u64 * self.max_pages as u64
    }

    /// Current local access to the page holding `offset`.
    pub fn access(&self, offset: u64) -> Option<Access> {
        self.region.lock().access(self.page_of(offset))
    }

    /// Reserve `size` bytes of shared memory; returns its global offset.
    pub async fn alloc(&mut self, size: u32) -> Result<u64, NodeError> {
        match self
            .request(Message::Alloc { size }, MessageType::AllocReply)
            .await?
        {
            Message::AllocReply { offset } => {
                tracing::debug!(node = %self.id, size, offset, "allocated");
                Ok(offset)
            }
            other => Err(unexpected(MessageType::AllocReply, &other)),
        }
    }

    /// Block until every node has called `barrier`.
    pub async fn barrier(&mut self) -> Result<(), NodeError> {
        self.request(Message::Barrier, MessageType::BarrierReply)
            .await
            .map(drop)
    }

    /// Distribute `value` from `root` to every node.
    ///
    /// Every node passes the same root; only the root's value counts. A
    /// barrier runs first so nobody reads the value before the root has
    /// produced it.
    pub async fn broadcast(&mut self, root: NodeId, value: u64) -> Result<u64, NodeError> {
        self.barrier().await?;
        match self
            .request(Message::Cast { root, value }, MessageType::CastReply)
            .await?
        {
            Message::CastReply { value } => Ok(value),
            other => Err(unexpected(MessageType::CastReply, &other)),
        }
    }

    /// Read `len` bytes at `offset`, faulting pages in as needed.
    pub async fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, NodeError> {
        let mut out = vec![0; len];
        let mut done = 0;
        while done < len {
            let at = offset + done as u64;
            let (page, in_page, take) = self.locate(at, len - done);
            let hit = self.region.lock().read(page, in_page, &mut out[done..done + take]);
            if hit {
                done += take;
            } else {
                self.fault(MessageType::ReadFault, at).await?;
            }
        }
        Ok(out)
    }

    /// Write `data` at `offset`, taking write ownership of pages as needed.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NodeError> {
        let mut done = 0;
        while done < data.len() {
            let at = offset + done as u64;
            let (page, in_page, take) = self.locate(at, data.len() - done);
            let hit = self.region.lock().write(page, in_page, &data[done..done + take]);
            if hit {
                done += take;
            } else {
                self.fault(MessageType::WriteFault, at).await?;
            }
        }
        Ok(())
    }

    pub async fn read_u64(&mut self, offset: u64) -> Result<u64, NodeError> {
        let bytes = self.read(offset, 8).await?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub async fn write_u64(&mut self, offset: u64, value: u64) -> Result<(), NodeError> {
        self.write(offset, &value.to_le_bytes()).await
    }

    /// Deregister and close the connection.
    pub async fn exit(mut self) -> Result<(), NodeError> {
        self.request(Message::Exit, MessageType::ExitReply).await?;
        tracing::debug!(node = %self.id, "exited");
        Ok(())
    }

    async fn fault(&mut self, request: MessageType, offset: u64) -> Result<(), NodeError> {
        let (message, expected) = match request {
            MessageType::WriteFault => (Message::WriteFault { offset }, MessageType::WriteFaultReply),
            _ => (Message::ReadFault { offset }, MessageType::ReadFaultReply),
        };
        tracing::debug!(node = %self.id, offset, "{}", request);
        // the agent installs the page before handing us the reply
        self.request(message, expected).await.map(drop)
    }

    fn page_of(&self, offset: u64) -> u32 {
        (offset / self.page_size as u64) as u32
    }

    /// Page, offset within it, and how much of `remaining` fits on it.
    fn locate(&self, at: u64, remaining: usize) -> (u32, usize, usize) {
        let in_page = (at % self.page_size as u64) as usize;
        let take = remaining.min(self.page_size as usize - in_page);
        (self.page_of(at), in_page, take)
    }

    async fn request(&mut self, message: Message, expected: MessageType) -> Result<Message, NodeError> {
        send(&self.writer, self.id, &message).await?;
        let reply = match self.replies.recv().await {
            Some(reply) => reply?,
            None => return Err(NodeError::Closed),
        };
        match reply {
            Message::Fail { request, code } => Err(NodeError::Rejected { request, code }),
            reply if reply.kind() == expected => Ok(reply),
            other => Err(unexpected(expected, &other)),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.agent.abort();
    }
}

async fn send(writer: &SharedWriter, id: NodeId, message: &Message) -> Result<(), WireError> {
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, &message.to_frame(id)).await
}

fn unexpected(expected: MessageType, got: &Message) -> NodeError {
    NodeError::UnexpectedReply {
        expected,
        got: got.kind(),
    }
}

/// Reads everything the allocator sends.
///
/// Page requests and invalidations are answered here, so they are served
/// even while the foreground is blocked on a barrier. Page state changes
/// are applied in wire order before the matching reply is handed on.
struct Agent<R> {
    id: NodeId,
    reader: R,
    writer: SharedWriter,
    region: Arc<Mutex<Region>>,
    replies: mpsc::UnboundedSender<Result<Message, WireError>>,
    incoming: Option<PageAssembler>,
}

impl<R: AsyncRead + Unpin> Agent<R> {
    async fn run(mut self) {
        loop {
            let step = match read_frame(&mut self.reader).await {
                Ok(frame) => match Message::from_frame(&frame) {
                    Ok(message) => self.handle(message).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                tracing::debug!(node = %self.id, error = %e, "agent stopped");
                let _ = self.replies.send(Err(e));
                return;
            }
        }
    }

    async fn handle(&mut self, message: Message) -> Result<(), WireError> {
        match message {
            Message::PageRequest { page, access } => self.serve_page(page, access).await,
            Message::Invalidate { page } => {
                self.region.lock().evict(page);
                tracing::debug!(node = %self.id, page, "invalidated");
                send(&self.writer, self.id, &Message::InvalidateReply { page }).await
            }
            Message::AllocReply { offset } => {
                {
                    let mut region = self.region.lock();
                    let page = (offset / region.page_size() as u64) as u32;
                    region.claim(page);
                }
                self.forward(Message::AllocReply { offset });
                Ok(())
            }
            Message::ReadFaultReply(chunk) => {
                self.fault_chunk(chunk, Access::ReadOnly, Message::ReadFaultReply)
            }
            Message::WriteFaultReply(chunk) => {
                self.fault_chunk(chunk, Access::ReadWrite, Message::WriteFaultReply)
            }
            other => {
                self.forward(other);
                Ok(())
            }
        }
    }

    async fn serve_page(&mut self, page: u32, access: PageAccess) -> Result<(), WireError> {
        let contents = {
            let mut region = self.region.lock();
            let contents = region.snapshot(page);
            match access {
                PageAccess::Share => region.downgrade(page),
                PageAccess::Release => {
                    region.evict(page);
                }
            }
            contents.unwrap_or_else(|| {
                tracing::warn!(node = %self.id, page, "page requested but not cached here, sending zeros");
                Bytes::from(vec![0; region.page_size() as usize])
            })
        };
        tracing::debug!(node = %self.id, page, ?access, "serving page");

        let mut writer = self.writer.lock().await;
        for chunk in split_page(page, &contents) {
            write_frame(&mut *writer, &Message::PageData(chunk).to_frame(self.id)).await?;
        }
        Ok(())
    }

    fn fault_chunk(
        &mut self,
        chunk: PageChunk,
        access: Access,
        wrap: fn(PageChunk) -> Message,
    ) -> Result<(), WireError> {
        let page_size = self.region.lock().page_size();
        let assembler = self
            .incoming
            .get_or_insert_with(|| PageAssembler::new(chunk.page(), page_size));
        assembler.push(&chunk)?;
        if !assembler.is_complete() {
            return Ok(());
        }
        if let Some(assembler) = self.incoming.take() {
            let page = assembler.page();
            self.region.lock().install(page, assembler.finish(), access);
        }
        self.forward(wrap(chunk));
        Ok(())
    }

    fn forward(&self, message: Message) {
        // the foreground may already be gone
        let _ = self.replies.send(Ok(message));
    }
}
