use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CHUNK_PREFIX_LEN, Frame, MessageType, NodeId, PageChunk, WireError};

/// What the current writer of a page must do with its copy when the
/// allocator asks for the page contents.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageAccess {
    /// Keep the page, downgraded to read-only.
    Share = 0,
    /// Give the page up entirely; a new writer is taking over.
    Release = 1,
}

/// Reason carried by a `FAIL` reply.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailCode {
    /// The page table is exhausted.
    OutOfPages = 1,
    /// Allocation size is zero or larger than a page.
    BadAllocationSize = 2,
    /// Fault offset is outside every allocated page.
    UnmappedPage = 3,
    /// The page's writer has exited; its contents are gone.
    StalePage = 4,
}

impl FailCode {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            1 => FailCode::OutOfPages,
            2 => FailCode::BadAllocationSize,
            3 => FailCode::UnmappedPage,
            4 => FailCode::StalePage,
            _ => return None,
        })
    }
}

impl fmt::Display for FailCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailCode::OutOfPages => "out of pages",
            FailCode::BadAllocationSize => "bad allocation size",
            FailCode::UnmappedPage => "unmapped page",
            FailCode::StalePage => "stale page",
        };
        f.write_str(s)
    }
}

/// A protocol message with its typed body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Init,
    InitReply {
        node_id: NodeId,
        total_nodes: u8,
        page_size: u32,
        max_pages: u32,
    },
    Exit,
    ExitReply,
    Barrier,
    BarrierReply,
    Alloc {
        size: u32,
    },
    AllocReply {
        offset: u64,
    },
    Cast {
        root: NodeId,
        value: u64,
    },
    CastReply {
        value: u64,
    },
    ReadFault {
        offset: u64,
    },
    ReadFaultReply(PageChunk),
    WriteFault {
        offset: u64,
    },
    WriteFaultReply(PageChunk),
    PageRequest {
        page: u32,
        access: PageAccess,
    },
    PageData(PageChunk),
    Invalidate {
        page: u32,
    },
    InvalidateReply {
        page: u32,
    },
    Fail {
        request: MessageType,
        code: FailCode,
    },
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Init => MessageType::Init,
            Message::InitReply { .. } => MessageType::InitReply,
            Message::Exit => MessageType::Exit,
            Message::ExitReply => MessageType::ExitReply,
            Message::Barrier => MessageType::Barrier,
            Message::BarrierReply => MessageType::BarrierReply,
            Message::Alloc { .. } => MessageType::Alloc,
            Message::AllocReply { .. } => MessageType::AllocReply,
            Message::Cast { .. } => MessageType::Cast,
            Message::CastReply { .. } => MessageType::CastReply,
            Message::ReadFault { .. } => MessageType::ReadFault,
            Message::ReadFaultReply(_) => MessageType::ReadFaultReply,
            Message::WriteFault { .. } => MessageType::WriteFault,
            Message::WriteFaultReply(_) => MessageType::WriteFaultReply,
            Message::PageRequest { .. } => MessageType::PageRequest,
            Message::PageData(_) => MessageType::PageData,
            Message::Invalidate { .. } => MessageType::Invalidate,
            Message::InvalidateReply { .. } => MessageType::InvalidateReply,
            Message::Fail { .. } => MessageType::Fail,
        }
    }

    /// Encode into a frame sent by `sender`.
    ///
    /// Every variant's body fits in one frame: the largest is a page chunk,
    /// bounded by [`PageChunk::new`].
    pub fn to_frame(&self, sender: NodeId) -> Frame {
        let mut body = BytesMut::new();
        match self {
            Message::Init
            | Message::Exit
            | Message::ExitReply
            | Message::Barrier
            | Message::BarrierReply => {}
            Message::InitReply {
                node_id,
                total_nodes,
                page_size,
                max_pages,
            } => {
                body.put_u8(node_id.as_u8());
                body.put_u8(*total_nodes);
                body.put_u32_le(*page_size);
                body.put_u32_le(*max_pages);
            }
            Message::Alloc { size } => body.put_u32_le(*size),
            Message::AllocReply { offset }
            | Message::ReadFault { offset }
            | Message::WriteFault { offset } => body.put_u64_le(*offset),
            Message::Cast { root, value } => {
                body.put_u8(root.as_u8());
                body.put_u64_le(*value);
            }
            Message::CastReply { value } => body.put_u64_le(*value),
            Message::ReadFaultReply(chunk)
            | Message::WriteFaultReply(chunk)
            | Message::PageData(chunk) => {
                body.put_u32_le(chunk.page());
                body.put_u32_le(chunk.offset());
                body.put_slice(chunk.bytes());
            }
            Message::PageRequest { page, access } => {
                body.put_u32_le(*page);
                body.put_u8(*access as u8);
            }
            Message::Invalidate { page } | Message::InvalidateReply { page } => {
                body.put_u32_le(*page)
            }
            Message::Fail { request, code } => {
                body.put_u8(request.as_u8());
                body.put_u8(*code as u8);
            }
        }
        debug_assert!(body.len() <= crate::MAX_BODY_LEN);
        Frame {
            kind: self.kind(),
            sender,
            body: body.freeze(),
        }
    }

    /// Parse the typed body of a frame.
    pub fn from_frame(frame: &Frame) -> Result<Message, WireError> {
        let kind = frame.kind;
        let mut body = Body {
            kind,
            buf: frame.body_bytes(),
        };
        let message = match kind {
            MessageType::Init => Message::Init,
            MessageType::Exit => Message::Exit,
            MessageType::ExitReply => Message::ExitReply,
            MessageType::Barrier => Message::Barrier,
            MessageType::BarrierReply => Message::BarrierReply,
            MessageType::InitReply => Message::InitReply {
                node_id: NodeId(body.u8()?),
                total_nodes: body.u8()?,
                page_size: body.u32()?,
                max_pages: body.u32()?,
            },
            MessageType::Alloc => Message::Alloc { size: body.u32()? },
            MessageType::AllocReply => Message::AllocReply {
                offset: body.u64()?,
            },
            MessageType::Cast => Message::Cast {
                root: NodeId(body.u8()?),
                value: body.u64()?,
            },
            MessageType::CastReply => Message::CastReply { value: body.u64()? },
            MessageType::ReadFault => Message::ReadFault {
                offset: body.u64()?,
            },
            MessageType::WriteFault => Message::WriteFault {
                offset: body.u64()?,
            },
            MessageType::ReadFaultReply => Message::ReadFaultReply(body.chunk()?),
            MessageType::WriteFaultReply => Message::WriteFaultReply(body.chunk()?),
            MessageType::PageData => Message::PageData(body.chunk()?),
            MessageType::PageRequest => Message::PageRequest {
                page: body.u32()?,
                access: match body.u8()? {
                    0 => PageAccess::Share,
                    1 => PageAccess::Release,
                    _ => return Err(body.malformed("unknown page access mode")),
                },
            },
            MessageType::Invalidate => Message::Invalidate { page: body.u32()? },
            MessageType::InvalidateReply => Message::InvalidateReply { page: body.u32()? },
            MessageType::Fail => {
                let request = MessageType::from_u8(body.u8()?)
                    .ok_or_else(|| body.malformed("unknown request type"))?;
                let code =
                    FailCode::from_u8(body.u8()?).ok_or_else(|| body.malformed("unknown fail code"))?;
                Message::Fail { request, code }
            }
        };
        body.finish()?;
        Ok(message)
    }
}

/// Bounds-checked reader over a frame body.
struct Body {
    kind: MessageType,
    buf: Bytes,
}

impl Body {
    fn malformed(&self, reason: &'static str) -> WireError {
        WireError::MalformedBody {
            kind: self.kind,
            reason,
        }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            return Err(self.malformed("body too short"));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn chunk(&mut self) -> Result<PageChunk, WireError> {
        self.need(CHUNK_PREFIX_LEN)?;
        let page = self.buf.get_u32_le();
        let offset = self.buf.get_u32_le();
        let bytes = self.buf.split_to(self.buf.len());
        PageChunk::new(page, offset, bytes).map_err(|_| self.malformed("chunk too long"))
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.buf.has_remaining() {
            return Err(self.malformed("trailing bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(message: &Message) -> Message {
        let frame = message.to_frame(NodeId(1));
        let (decoded, _) = crate::decode(&frame.encode()).unwrap();
        Message::from_frame(&decoded).unwrap()
    }

    #[test]
    fn alloc_body_is_little_endian_size() {
        let frame = Message::Alloc { size: 800 }.to_frame(NodeId(0));
        assert_eq!(frame.body(), &800u32.to_le_bytes());
        assert_eq!(frame.total_len(), 7);
    }

    #[test]
    fn init_reply_carries_assignment() {
        let reply = Message::InitReply {
            node_id: NodeId(2),
            total_nodes: 3,
            page_size: 4096,
            max_pages: 1000,
        };
        let frame = reply.to_frame(NodeId::ALLOCATOR);
        assert_eq!(frame.sender, NodeId::ALLOCATOR);
        assert_eq!(&frame.body()[..2], &[2, 3]);
        assert_eq!(reparse(&reply), reply);
    }

    #[test]
    fn cast_and_fault_bodies_parse() {
        let cast = Message::Cast {
            root: NodeId(1),
            value: 0xDEAD_BEEF,
        };
        assert_eq!(reparse(&cast), cast);

        let fault = Message::WriteFault { offset: 4096 + 12 };
        assert_eq!(reparse(&fault), fault);
    }

    #[test]
    fn page_chunk_fills_a_frame() {
        let chunk = PageChunk::new(9, 480, Bytes::from(vec![7u8; crate::PAGE_CHUNK_LEN])).unwrap();
        let message = Message::PageData(chunk);
        let frame = message.to_frame(NodeId(0));
        assert!(frame.total_len() <= crate::MAX_FRAME_LEN);
        assert_eq!(reparse(&message), message);
    }

    #[test]
    fn short_and_trailing_bodies_are_malformed() {
        let frame = Frame::new(MessageType::Alloc, NodeId(0), vec![1, 2]).unwrap();
        assert!(matches!(
            Message::from_frame(&frame),
            Err(WireError::MalformedBody {
                kind: MessageType::Alloc,
                ..
            })
        ));

        let frame = Frame::new(MessageType::Barrier, NodeId(0), vec![0]).unwrap();
        assert!(Message::from_frame(&frame).is_err());

        let frame = Frame::new(MessageType::PageRequest, NodeId(0), vec![0, 0, 0, 0, 9]).unwrap();
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn fail_reply_names_request() {
        let fail = Message::Fail {
            request: MessageType::Alloc,
            code: FailCode::OutOfPages,
        };
        assert_eq!(reparse(&fail), fail);
        assert_eq!(FailCode::StalePage.to_string(), "stale page");
    }
}
