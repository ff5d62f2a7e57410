//! The allocator's session loop.
//!
//! One [`Coordinator`] owns the page table, the connection registry and the
//! pending queue for the whole run. Everything that mutates them happens on
//! the coordinator's task, one request at a time.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use dsm_wire::{FailCode, Message, MessageType, NodeId, PageAccess, read_frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::Instant;

use crate::{
    AllocatorConfig, Connection, ConnectionRegistry, DsmError, FaultKind, FaultResolution,
    OPS_TARGET, Observation, PageTable, PendingQueue, Rendezvous, Route, SessionStats, route,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for every node's INIT.
    Accepting,
    /// Multiplexing requests from all live nodes.
    Serving,
    /// Every node has exited.
    Draining,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Accepting => "accepting",
            Phase::Serving => "serving",
            Phase::Draining => "draining",
            Phase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

pub struct Coordinator {
    config: AllocatorConfig,
    phase: Phase,
    table: PageTable,
    registry: ConnectionRegistry,
    pending: PendingQueue,
    stats: SessionStats,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("phase", &self.phase)
            .field("live", &self.registry.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(config: AllocatorConfig) -> Result<Self, DsmError> {
        config.validate()?;
        let table = PageTable::new(config.page_size, config.max_pages);
        Ok(Self {
            config,
            phase: Phase::Accepting,
            table,
            registry: ConnectionRegistry::new(),
            pending: PendingQueue::new(),
            stats: SessionStats::default(),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn live_nodes(&self) -> usize {
        self.registry.len()
    }

    /// Run a whole session on `listener`: admit every node, serve until the
    /// last one exits, and return the run's counters.
    pub async fn run(mut self, listener: TcpListener) -> Result<SessionStats, DsmError> {
        tracing::info!(target: OPS_TARGET, "-= {} node processes", self.config.total_nodes);
        self.accept_all(&listener).await?;
        drop(listener);
        self.serve().await?;
        Ok(self.finish())
    }

    /// Accept connections until `total_nodes` have registered.
    pub async fn accept_all(&mut self, listener: &TcpListener) -> Result<(), DsmError> {
        tracing::info!(
            addr = ?listener.local_addr().ok(),
            nodes = self.config.total_nodes,
            "waiting for nodes"
        );
        while self.phase == Phase::Accepting {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let node = self.admit(stream).await?;
            tracing::info!(node = %node, peer = %peer, "node registered");
        }
        Ok(())
    }

    /// Complete the INIT handshake on a fresh connection and register it.
    ///
    /// Anything other than INIT as the first message aborts the run: the
    /// node it came from can never take part.
    pub async fn admit<S>(&mut self, mut stream: S) -> Result<NodeId, DsmError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.phase != Phase::Accepting {
            return Err(DsmError::protocol(
                None,
                format!("connection offered while {}", self.phase),
            ));
        }
        let frame = read_frame(&mut stream)
            .await
            .map_err(|e| DsmError::protocol(None, format!("handshake failed: {}", e)))?;
        if frame.kind != MessageType::Init {
            return Err(DsmError::protocol(
                None,
                format!("first message was {}, expected INIT", frame.kind),
            ));
        }

        let node = self.registry.next_id();
        let mut connection = Connection::new(node, stream);
        connection
            .send(&Message::InitReply {
                node_id: node,
                total_nodes: self.config.total_nodes as u8,
                page_size: self.config.page_size,
                max_pages: self.config.max_pages,
            })
            .await?;
        self.registry.register(connection)?;
        self.stats.nodes_served += 1;

        if self.registry.len() == self.config.total_nodes {
            tracing::info!(nodes = self.registry.len(), "all nodes registered");
            self.phase = Phase::Serving;
        }
        Ok(node)
    }

    /// Serve requests until every node has exited.
    pub async fn serve(&mut self) -> Result<(), DsmError> {
        if self.phase != Phase::Serving {
            return Err(DsmError::protocol(
                None,
                format!("cannot serve while {}", self.phase),
            ));
        }
        while !self.registry.is_empty() {
            while let Some((node, message)) = self.pending.pop() {
                self.handle(node, message).await?;
            }
            if self.registry.is_empty() {
                break;
            }
            let ready = self.registry.next_ready().await?;
            self.enqueue(ready)?;
        }
        self.phase = Phase::Draining;
        Ok(())
    }

    /// Release the session state and hand back the counters.
    pub fn finish(mut self) -> SessionStats {
        self.stats.pages_in_use = self.table.pages_in_use();
        tracing::info!(
            nodes = self.stats.nodes_served,
            allocations = self.stats.allocations,
            pages = self.stats.pages_in_use,
            dropped = self.stats.dropped_messages,
            "session finished"
        );
        self.phase = Phase::Terminated;
        self.stats
    }

    /// Dispatch one request, dropping it if it is merely invalid.
    async fn handle(&mut self, node: NodeId, message: Message) -> Result<(), DsmError> {
        if !self.registry.contains(node) {
            tracing::warn!(node = %node, kind = %message.kind(), "request from a node that already exited");
            self.stats.dropped_messages += 1;
            return Ok(());
        }
        match self.dispatch(node, message).await {
            Ok(()) => Ok(()),
            Err(e) => self.survive(e),
        }
    }

    /// Queue what one readiness wait collected, dropping invalid traffic.
    fn enqueue(&mut self, ready: Vec<(NodeId, Result<Message, DsmError>)>) -> Result<(), DsmError> {
        for (node, message) in ready {
            match message {
                Ok(message) => self.pending.push(node, message),
                Err(e) => self.survive(e)?,
            }
        }
        Ok(())
    }

    fn survive(&mut self, err: DsmError) -> Result<(), DsmError> {
        if err.is_fatal() {
            return Err(err);
        }
        tracing::warn!(error = %err, "dropping message");
        self.stats.dropped_messages += 1;
        Ok(())
    }

    /// Route a request and run its handler to completion.
    pub async fn dispatch(&mut self, node: NodeId, message: Message) -> Result<(), DsmError> {
        match route(node, &message)? {
            Route::Barrier => {
                let rendezvous = Rendezvous::barrier(node, self.registry.iter_live());
                self.collective(rendezvous).await
            }
            Route::Broadcast { root, value } => {
                let rendezvous = Rendezvous::broadcast(node, root, value, self.registry.iter_live())?;
                self.collective(rendezvous).await
            }
            route => self.dispatch_ordinary(node, route).await,
        }
    }

    /// Handlers that never wait on a collective.
    async fn dispatch_ordinary(&mut self, node: NodeId, route: Route) -> Result<(), DsmError> {
        tracing::debug!(node = %node, route = %route, "dispatch");
        match route {
            Route::Close => self.handle_close(node).await,
            Route::Allocate { size } => self.handle_alloc(node, size).await,
            Route::Fault { kind, offset } => self.handle_fault(node, kind, offset).await,
            Route::Barrier | Route::Broadcast { .. } => Err(DsmError::protocol(
                node,
                format!("{} inside another collective", route),
            )),
        }
    }

    async fn handle_close(&mut self, node: NodeId) -> Result<(), DsmError> {
        self.registry.send(node, &Message::ExitReply).await?;
        self.registry.unregister(node);
        // pages it writes stay assigned to it; later faults on them fail as stale
        self.table.forget_reader(node);
        tracing::info!(
            node = %node,
            live = self.registry.len(),
            dropped = self.pending.queued_for(node),
            "node exited"
        );
        Ok(())
    }

    async fn handle_alloc(&mut self, node: NodeId, size: u32) -> Result<(), DsmError> {
        let page_size = self.table.page_size();
        let reply = if size == 0 || size > page_size {
            tracing::warn!(node = %node, size, page_size, "allocation size out of range");
            self.fail(MessageType::Alloc, FailCode::BadAllocationSize)
        } else {
            match self.table.allocate(node, size) {
                Ok(allocation) => {
                    let offset = allocation.global_offset(page_size);
                    tracing::info!(
                        target: OPS_TARGET,
                        "#{}: allocated {}-{}",
                        node,
                        offset,
                        allocation.global_end(page_size)
                    );
                    self.stats.allocations += 1;
                    self.stats.bytes_allocated += size as u64;
                    Message::AllocReply { offset }
                }
                Err(DsmError::OutOfPages { max_pages }) => {
                    tracing::warn!(node = %node, size, max_pages, "page table exhausted");
                    self.fail(MessageType::Alloc, FailCode::OutOfPages)
                }
                Err(e) => return Err(e),
            }
        };
        self.registry.send(node, &reply).await
    }

    fn fail(&mut self, request: MessageType, code: FailCode) -> Message {
        self.stats.failed_requests += 1;
        Message::Fail { request, code }
    }

    async fn handle_fault(&mut self, node: NodeId, kind: FaultKind, offset: u64) -> Result<(), DsmError> {
        let begun = {
            let registry = &self.registry;
            FaultResolution::begin(kind, node, offset, &self.table, |n| registry.contains(n))
        };
        let mut fault = match begun {
            Ok(fault) => fault,
            Err(code) => {
                tracing::warn!(node = %node, offset, code = %code, "{} fault cannot be served", kind);
                let request = match kind {
                    FaultKind::Read => MessageType::ReadFault,
                    FaultKind::Write => MessageType::WriteFault,
                };
                let reply = self.fail(request, code);
                return self.registry.send(node, &reply).await;
            }
        };
        let deadline = Deadline::start(self.config.wait_deadline);
        let page = fault.page();
        let owner = fault.owner();
        match kind {
            FaultKind::Read => self.stats.read_faults += 1,
            FaultKind::Write => self.stats.write_faults += 1,
        }
        tracing::info!(target: OPS_TARGET, "#{}: {} fault @ {}", node, kind, page);

        let request = fault.page_request();
        self.registry.send(owner, &request).await?;
        while !fault.content_complete() {
            let message = match self.recv_within(deadline, owner, || format!("page {} from node {}", page, owner)).await {
                Ok(message) => message,
                Err(e) => {
                    self.survive(e)?;
                    continue;
                }
            };
            if let Some(other) = fault.accept_content(message)? {
                self.pending.push(owner, other);
            }
        }
        match request {
            Message::PageRequest {
                access: PageAccess::Release,
                ..
            } => tracing::info!(target: OPS_TARGET, "#{}: releasing ownership of {}", owner, page),
            _ => tracing::info!(target: OPS_TARGET, "#{}: sharing {}", owner, page),
        }

        let readers = {
            let registry = &self.registry;
            fault.readers_to_invalidate(&self.table, |n| registry.contains(n))
        };
        for &reader in &readers {
            self.registry.send(reader, &Message::Invalidate { page }).await?;
            self.stats.invalidations += 1;
            tracing::info!(target: OPS_TARGET, "#{}: invalidating {}", reader, page);
        }
        for reader in readers {
            loop {
                let message = match self
                    .recv_within(deadline, reader, || format!("invalidation of page {} by node {}", page, reader))
                    .await
                {
                    Ok(message) => message,
                    Err(e) => {
                        self.survive(e)?;
                        continue;
                    }
                };
                match fault.accept_invalidation(reader, message) {
                    None => break,
                    Some(other) => self.pending.push(reader, other),
                }
            }
        }

        let faulter = fault.faulter();
        let replies = fault.commit(&mut self.table)?;
        match kind {
            FaultKind::Read => {
                tracing::info!(target: OPS_TARGET, "#{}: receiving read permission for {}", faulter, page)
            }
            FaultKind::Write => {
                tracing::info!(target: OPS_TARGET, "#{}: receiving ownership of {}", faulter, page)
            }
        }
        for reply in &replies {
            self.registry.send(faulter, reply).await?;
        }
        Ok(())
    }

    /// Drive a barrier or broadcast to completion, then release everyone.
    async fn collective(&mut self, mut rendezvous: Rendezvous) -> Result<(), DsmError> {
        let kind = rendezvous.kind();
        let initiator = rendezvous.initiator();
        if self.registry.len() < self.config.total_nodes {
            return Err(DsmError::protocol(
                initiator,
                format!(
                    "{} needs all {} nodes but only {} are connected",
                    kind,
                    self.config.total_nodes,
                    self.registry.len()
                ),
            ));
        }
        tracing::debug!(initiator = %initiator, kind = %kind, "collective opened");

        let deadline = Deadline::start(self.config.wait_deadline);
        while !rendezvous.is_complete() {
            let Some((node, message)) = self.pending.pop() else {
                let waiting = || {
                    let nodes: Vec<String> = rendezvous.waiting_on().map(|n| n.to_string()).collect();
                    format!("{} (nodes {})", kind, nodes.join(", "))
                };
                let ready = within(deadline, waiting, self.registry.next_ready()).await?;
                self.enqueue(ready)?;
                continue;
            };
            if let Observation::Unrelated(message) = rendezvous.observe(node, message)? {
                let outcome = match route(node, &message) {
                    Ok(route) => self.dispatch_ordinary(node, route).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    self.survive(e)?;
                }
            }
        }

        let release = rendezvous.release()?;
        self.registry.broadcast(&release).await?;
        match release {
            Message::CastReply { value } => {
                self.stats.broadcasts += 1;
                tracing::debug!(initiator = %initiator, value, "broadcast released");
            }
            _ => {
                self.stats.barriers += 1;
                tracing::debug!(initiator = %initiator, "barrier released");
            }
        }
        Ok(())
    }

    async fn recv_within(
        &mut self,
        deadline: Option<Deadline>,
        node: NodeId,
        waiting_on: impl FnOnce() -> String,
    ) -> Result<Message, DsmError> {
        within(deadline, waiting_on, self.registry.recv_from(node)).await
    }
}

/// Point in time by which a whole collective or fault must finish.
///
/// Fixed when the operation opens; every wait inside it shares the bound.
#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    after: Duration,
}

impl Deadline {
    fn start(after: Option<Duration>) -> Option<Self> {
        after.map(|after| Self {
            at: Instant::now() + after,
            after,
        })
    }
}

/// Await `fut`, failing with [`DsmError::Timeout`] once `deadline` passes.
async fn within<T, F>(
    deadline: Option<Deadline>,
    waiting_on: impl FnOnce() -> String,
    fut: F,
) -> Result<T, DsmError>
where
    F: Future<Output = Result<T, DsmError>>,
{
    match deadline {
        None => fut.await,
        Some(Deadline { at, after }) => match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => Err(DsmError::Timeout {
                waiting_on: waiting_on(),
                after,
            }),
        },
    }
}
