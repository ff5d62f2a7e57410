use bytes::{Bytes, BytesMut};

use crate::WireError;

/// Page bytes carried by one frame.
///
/// Body layout: `page u32, chunk_offset u32, bytes`. 240 data bytes leave
/// room for the 8-byte prefix inside the 252-byte body limit.
pub const PAGE_CHUNK_LEN: usize = 240;

/// Encoded size of the `page` and `chunk_offset` prefix.
pub const CHUNK_PREFIX_LEN: usize = 8;

/// A slice of a page's contents at a given offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageChunk {
    page: u32,
    offset: u32,
    bytes: Bytes,
}

impl PageChunk {
    pub fn new(page: u32, offset: u32, bytes: Bytes) -> Result<Self, WireError> {
        if bytes.len() > PAGE_CHUNK_LEN {
            return Err(WireError::BodyTooLong {
                len: CHUNK_PREFIX_LEN + bytes.len(),
            });
        }
        Ok(Self {
            page,
            offset,
            bytes,
        })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Number of chunks a page of `page_size` bytes is split into.
pub fn chunk_count(page_size: u32) -> usize {
    (page_size as usize).div_ceil(PAGE_CHUNK_LEN)
}

/// Split a whole page into chunks in ascending offset order.
pub fn split_page(page: u32, contents: &Bytes) -> impl Iterator<Item = PageChunk> + '_ {
    (0..contents.len())
        .step_by(PAGE_CHUNK_LEN)
        .map(move |start| {
            let end = (start + PAGE_CHUNK_LEN).min(contents.len());
            PageChunk {
                page,
                offset: start as u32,
                bytes: contents.slice(start..end),
            }
        })
}

/// Reassembles one page from its chunks.
///
/// Chunks must arrive for the expected page, in order, without gaps.
#[derive(Debug)]
pub struct PageAssembler {
    page: u32,
    page_size: u32,
    buf: BytesMut,
}

impl PageAssembler {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            buf: BytesMut::with_capacity(page_size as usize),
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, chunk: &PageChunk) -> Result<(), WireError> {
        let expected_offset = self.buf.len() as u32;
        let fits = chunk.offset as usize + chunk.bytes.len() <= self.page_size as usize;
        if chunk.page != self.page || chunk.offset != expected_offset || !fits {
            return Err(WireError::ChunkMismatch {
                page: self.page,
                expected_offset,
                got_page: chunk.page,
                got_offset: chunk.offset,
            });
        }
        self.buf.extend_from_slice(&chunk.bytes);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.buf.len() == self.page_size as usize
    }

    /// Take the assembled page. Only meaningful once [`is_complete`](Self::is_complete).
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
