//! Read and write fault resolution.
//!
//! [`FaultResolution`] tracks one in-flight fault through
//! `Requested -> AwaitingOwnerReply -> Resolved`. It decides who must be
//! asked for what and applies the ownership change; the coordinator moves
//! the bytes.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use dsm_wire::{FailCode, Message, NodeId, PageAccess, PageAssembler, chunk_count, split_page};

use crate::{DsmError, PageTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Read => write!(f, "read"),
            FaultKind::Write => write!(f, "write"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FaultState {
    Requested,
    AwaitingOwnerReply,
    Resolved,
}

#[derive(Debug)]
pub struct FaultResolution {
    kind: FaultKind,
    faulter: NodeId,
    page: u32,
    owner: NodeId,
    state: FaultState,
    content: PageAssembler,
    invalidating: BTreeSet<NodeId>,
}

impl FaultResolution {
    /// Look up the page behind `offset` and its current writer.
    ///
    /// Faults that cannot be served become a FAIL reply for the faulting
    /// node: outside every allocated page, or on a page whose writer is no
    /// longer connected.
    pub fn begin(
        kind: FaultKind,
        faulter: NodeId,
        offset: u64,
        table: &PageTable,
        is_live: impl Fn(NodeId) -> bool,
    ) -> Result<Self, FailCode> {
        let page = table
            .page_of(offset)
            .filter(|&page| table.is_allocated(page))
            .ok_or(FailCode::UnmappedPage)?;
        let owner = table.writer_of(page).ok_or(FailCode::UnmappedPage)?;
        if !is_live(owner) {
            return Err(FailCode::StalePage);
        }
        Ok(Self {
            kind,
            faulter,
            page,
            owner,
            state: FaultState::Requested,
            content: PageAssembler::new(page, table.page_size()),
            invalidating: BTreeSet::new(),
        })
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn faulter(&self) -> NodeId {
        self.faulter
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// The request to send to the page's writer.
    ///
    /// A write fault by anyone other than the writer takes the page away
    /// from it; every other case leaves the writer a read-only copy.
    pub fn page_request(&mut self) -> Message {
        self.state = FaultState::AwaitingOwnerReply;
        let access = match self.kind {
            FaultKind::Write if self.owner != self.faulter => PageAccess::Release,
            _ => PageAccess::Share,
        };
        Message::PageRequest {
            page: self.page,
            access,
        }
    }

    /// Offer a message read from the owner's connection.
    ///
    /// Returns the message back when it is not part of the page transfer,
    /// so the caller can queue it.
    pub fn accept_content(&mut self, message: Message) -> Result<Option<Message>, DsmError> {
        match message {
            Message::PageData(chunk) if chunk.page() == self.page => {
                self.content.push(&chunk).map_err(|e| {
                    DsmError::protocol(self.owner, format!("bad page content for page {}: {}", self.page, e))
                })?;
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    pub fn content_complete(&self) -> bool {
        self.content.is_complete()
    }

    /// Readers that must drop their copy before the faulting node may write.
    ///
    /// Empty for read faults. The owner is handled by the page request and
    /// the faulting node is about to receive fresh content.
    pub fn readers_to_invalidate(&mut self, table: &PageTable, is_live: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        if self.kind == FaultKind::Read {
            return Vec::new();
        }
        self.invalidating = table
            .readers_of(self.page)
            .filter(|&n| n != self.owner && n != self.faulter && is_live(n))
            .collect();
        self.invalidating.iter().copied().collect()
    }

    /// Offer a message read from a reader being invalidated.
    pub fn accept_invalidation(&mut self, node: NodeId, message: Message) -> Option<Message> {
        match message {
            Message::InvalidateReply { page } if page == self.page && self.invalidating.contains(&node) => {
                self.invalidating.remove(&node);
                None
            }
            other => Some(other),
        }
    }

    pub fn invalidations_complete(&self) -> bool {
        self.invalidating.is_empty()
    }

    /// Record the new access rights and produce the replies for the
    /// faulting node.
    pub fn commit(mut self, table: &mut PageTable) -> Result<Vec<Message>, DsmError> {
        if !self.invalidations_complete() {
            return Err(DsmError::protocol(
                self.faulter,
                format!("page {} committed while readers still hold copies", self.page),
            ));
        }
        if self.state != FaultState::AwaitingOwnerReply || !self.content.is_complete() {
            return Err(DsmError::protocol(
                self.owner,
                format!(
                    "page {} committed with {} of {} bytes",
                    self.page,
                    self.content.received(),
                    table.page_size()
                ),
            ));
        }
        match self.kind {
            FaultKind::Read => table.add_reader(self.page, self.faulter)?,
            FaultKind::Write => table.set_writer(self.page, self.faulter)?,
        }
        self.state = FaultState::Resolved;

        let kind = self.kind;
        let page = self.page;
        let content: Bytes = self.content.finish();
        let mut replies = Vec::with_capacity(chunk_count(table.page_size()));
        replies.extend(split_page(page, &content).map(|chunk| match kind {
            FaultKind::Read => Message::ReadFaultReply(chunk),
            FaultKind::Write => Message::WriteFaultReply(chunk),
        }));
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsm_wire::PageChunk;

    fn table_with_page(owner: NodeId) -> PageTable {
        let mut table = PageTable::new(480, 4);
        table.allocate(owner, 16).unwrap();
        table
    }

    fn feed_page(fault: &mut FaultResolution, fill: u8) {
        let content = Bytes::from(vec![fill; 480]);
        for chunk in split_page(fault.page(), &content) {
            assert!(fault.accept_content(Message::PageData(chunk)).unwrap().is_none());
        }
    }

    #[test]
    fn unmapped_and_stale_pages_fail() {
        let table = table_with_page(NodeId(0));
        let live = |_| true;
        assert_eq!(
            FaultResolution::begin(FaultKind::Read, NodeId(1), 480, &table, live).unwrap_err(),
            FailCode::UnmappedPage
        );
        assert_eq!(
            FaultResolution::begin(FaultKind::Read, NodeId(1), 480 * 99, &table, live).unwrap_err(),
            FailCode::UnmappedPage
        );
        assert_eq!(
            FaultResolution::begin(FaultKind::Read, NodeId(1), 3, &table, |n| n != NodeId(0)).unwrap_err(),
            FailCode::StalePage
        );
    }

    #[test]
    fn read_fault_adds_reader_and_keeps_writer() {
        let mut table = table_with_page(NodeId(0));
        let mut fault = FaultResolution::begin(FaultKind::Read, NodeId(1), 10, &table, |_| true).unwrap();
        assert_eq!(fault.state, FaultState::Requested);
        assert_eq!(
            fault.page_request(),
            Message::PageRequest {
                page: 0,
                access: PageAccess::Share
            }
        );
        assert!(fault.readers_to_invalidate(&table, |_| true).is_empty());

        feed_page(&mut fault, 0xAB);
        assert!(fault.content_complete());
        let replies = fault.commit(&mut table).unwrap();

        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[0], Message::ReadFaultReply(c) if c.bytes()[0] == 0xAB));
        assert_eq!(table.writer_of(0), Some(NodeId(0)));
        assert_eq!(table.readers_of(0).collect::<Vec<_>>(), vec![NodeId(0), NodeId(1)]);
    }

    #[test]
    fn write_fault_releases_owner_and_invalidates_readers() {
        let mut table = table_with_page(NodeId(0));
        table.add_reader(0, NodeId(1)).unwrap();
        table.add_reader(0, NodeId(2)).unwrap();

        let mut fault = FaultResolution::begin(FaultKind::Write, NodeId(1), 0, &table, |_| true).unwrap();
        assert_eq!(
            fault.page_request(),
            Message::PageRequest {
                page: 0,
                access: PageAccess::Release
            }
        );
        assert_eq!(fault.readers_to_invalidate(&table, |_| true), vec![NodeId(2)]);

        let stray = fault.accept_invalidation(NodeId(2), Message::Alloc { size: 1 });
        assert_eq!(stray, Some(Message::Alloc { size: 1 }));
        let reply = fault.accept_invalidation(NodeId(2), Message::InvalidateReply { page: 0 });
        assert!(reply.is_none());
        assert!(fault.invalidations_complete());

        feed_page(&mut fault, 1);
        let replies = fault.commit(&mut table).unwrap();
        assert!(replies.iter().all(|m| matches!(m, Message::WriteFaultReply(_))));
        assert_eq!(table.writer_of(0), Some(NodeId(1)));
        assert_eq!(table.readers_of(0).collect::<Vec<_>>(), vec![NodeId(1)]);
    }

    #[test]
    fn writer_upgrading_its_own_page_is_asked_to_share() {
        let table = table_with_page(NodeId(0));
        let mut fault = FaultResolution::begin(FaultKind::Write, NodeId(0), 0, &table, |_| true).unwrap();
        assert!(matches!(
            fault.page_request(),
            Message::PageRequest {
                access: PageAccess::Share,
                ..
            }
        ));
    }

    #[test]
    fn foreign_traffic_is_handed_back() {
        let table = table_with_page(NodeId(0));
        let mut fault = FaultResolution::begin(FaultKind::Read, NodeId(1), 0, &table, |_| true).unwrap();
        fault.page_request();

        let other_page = PageChunk::new(3, 0, Bytes::from_static(&[0; 8])).unwrap();
        assert!(fault.accept_content(Message::PageData(other_page)).unwrap().is_some());
        assert_eq!(
            fault.accept_content(Message::Barrier).unwrap(),
            Some(Message::Barrier)
        );
        assert!(!fault.content_complete());
    }

    #[test]
    fn commit_before_content_is_a_violation() {
        let mut table = table_with_page(NodeId(0));
        let mut fault = FaultResolution::begin(FaultKind::Read, NodeId(1), 0, &table, |_| true).unwrap();
        fault.page_request();
        assert!(matches!(
            fault.commit(&mut table),
            Err(DsmError::ProtocolViolation { .. })
        ));
        assert_eq!(table.readers_of(0).collect::<Vec<_>>(), vec![NodeId(0)]);
    }

    #[test]
    fn commit_waits_for_every_invalidation() {
        let mut table = table_with_page(NodeId(0));
        table.add_reader(0, NodeId(2)).unwrap();
        let mut fault = FaultResolution::begin(FaultKind::Write, NodeId(1), 0, &table, |_| true).unwrap();
        fault.page_request();
        assert_eq!(fault.readers_to_invalidate(&table, |_| true), vec![NodeId(2)]);
        feed_page(&mut fault, 4);

        assert!(!fault.invalidations_complete());
        assert!(matches!(
            fault.commit(&mut table),
            Err(DsmError::ProtocolViolation { .. })
        ));
        assert_eq!(table.writer_of(0), Some(NodeId(0)));
    }
}
