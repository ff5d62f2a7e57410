//! Authoritative page ownership state.
//!
//! Pages are handed out in index order and never freed. Each page has at
//! most one writer and a set of readers; [`PageTable::set_writer`] is the
//! only way to change the writer and always collapses the readers to the
//! new writer alone.

use std::collections::{BTreeSet, HashMap};

use dsm_wire::NodeId;

use crate::DsmError;

/// A sub-page reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub page: u32,
    /// Offset within the page.
    pub offset: u32,
    pub size: u32,
}

impl Allocation {
    /// Offset of the first byte in the shared address space.
    pub fn global_offset(&self, page_size: u32) -> u64 {
        self.page as u64 * page_size as u64 + self.offset as u64
    }

    /// Offset one past the last byte, in the shared address space.
    pub fn global_end(&self, page_size: u32) -> u64 {
        self.global_offset(page_size) + self.size as u64
    }
}

#[derive(Debug, Default)]
struct PageEntry {
    writer: Option<NodeId>,
    readers: BTreeSet<NodeId>,
    /// Reservations in offset order.
    allocations: Vec<Allocation>,
}

impl PageEntry {
    fn used(&self) -> u32 {
        self.allocations.last().map_or(0, |a| a.offset + a.size)
    }
}

#[derive(Debug)]
pub struct PageTable {
    page_size: u32,
    max_pages: u32,
    pages: Vec<PageEntry>,
    /// Page each node last allocated on.
    current: HashMap<NodeId, u32>,
}

impl PageTable {
    pub fn new(page_size: u32, max_pages: u32) -> Self {
        Self {
            page_size,
            max_pages,
            pages: Vec::new(),
            current: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Number of pages handed out so far.
    pub fn pages_in_use(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Page containing a global byte offset, if it lies inside the table.
    pub fn page_of(&self, offset: u64) -> Option<u32> {
        let page = offset / self.page_size as u64;
        (page < self.max_pages as u64).then_some(page as u32)
    }

    pub fn is_allocated(&self, page: u32) -> bool {
        (page as usize) < self.pages.len()
    }

    /// Hand out the next unused page. It starts with no writer and no readers.
    pub fn allocate_page(&mut self) -> Result<u32, DsmError> {
        if self.pages.len() as u32 >= self.max_pages {
            return Err(DsmError::OutOfPages {
                max_pages: self.max_pages,
            });
        }
        self.pages.push(PageEntry::default());
        Ok(self.pages.len() as u32 - 1)
    }

    /// Reserve `size` bytes on `page`, first fit after the existing reservations.
    pub fn reserve(&mut self, page: u32, size: u32) -> Result<u32, DsmError> {
        let page_size = self.page_size;
        let entry = self.entry_mut(page)?;
        let offset = entry.used();
        if size == 0 || page_size - offset < size {
            return Err(DsmError::PageFull {
                page,
                requested: size,
            });
        }
        entry.allocations.push(Allocation { page, offset, size });
        Ok(offset)
    }

    /// Place an allocation for `node`.
    ///
    /// Reuses the node's current page while it still holds it exclusively
    /// and the request fits; otherwise moves the node to a fresh page. The
    /// node ends up as writer and sole reader of the page holding the
    /// allocation.
    pub fn allocate(&mut self, node: NodeId, size: u32) -> Result<Allocation, DsmError> {
        if size == 0 || size > self.page_size {
            return Err(DsmError::PageFull {
                page: self.pages_in_use(),
                requested: size,
            });
        }

        let reusable = self
            .current
            .get(&node)
            .copied()
            .filter(|&page| self.is_exclusive(page, node));

        let (page, offset) = match reusable.map(|page| (page, self.reserve(page, size))) {
            Some((page, Ok(offset))) => (page, offset),
            Some((_, Err(DsmError::PageFull { .. }))) | None => {
                let page = self.allocate_page()?;
                (page, self.reserve(page, size)?)
            }
            Some((_, Err(e))) => return Err(e),
        };

        self.current.insert(node, page);
        self.set_writer(page, node)?;
        Ok(Allocation { page, offset, size })
    }

    /// Make `node` the only writer and the only reader of `page`.
    pub fn set_writer(&mut self, page: u32, node: NodeId) -> Result<(), DsmError> {
        let entry = self.entry_mut(page)?;
        entry.writer = Some(node);
        entry.readers.clear();
        entry.readers.insert(node);
        Ok(())
    }

    pub fn add_reader(&mut self, page: u32, node: NodeId) -> Result<(), DsmError> {
        self.entry_mut(page)?.readers.insert(node);
        Ok(())
    }

    /// Forget every read copy held by `node`. Pages it writes keep it as writer.
    pub fn forget_reader(&mut self, node: NodeId) {
        for entry in &mut self.pages {
            if entry.writer != Some(node) {
                entry.readers.remove(&node);
            }
        }
        self.current.remove(&node);
    }

    /// Whether `node` is the writer and nobody else holds a copy.
    pub fn is_exclusive(&self, page: u32, node: NodeId) -> bool {
        self.pages.get(page as usize).is_some_and(|e| {
            e.writer == Some(node) && e.readers.len() == 1 && e.readers.contains(&node)
        })
    }

    pub fn writer_of(&self, page: u32) -> Option<NodeId> {
        self.pages.get(page as usize).and_then(|e| e.writer)
    }

    pub fn readers_of(&self, page: u32) -> impl Iterator<Item = NodeId> + '_ {
        self.pages
            .get(page as usize)
            .into_iter()
            .flat_map(|e| e.readers.iter().copied())
    }

    pub fn allocations_on(&self, page: u32) -> &[Allocation] {
        self.pages
            .get(page as usize)
            .map_or(&[], |e| e.allocations.as_slice())
    }

    fn entry_mut(&mut self, page: u32) -> Result<&mut PageEntry, DsmError> {
        let len = self.pages.len();
        self.pages.get_mut(page as usize).ok_or_else(|| {
            DsmError::protocol(None, format!("page {} is not allocated ({} in use)", page, len))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readers(table: &PageTable, page: u32) -> Vec<NodeId> {
        table.readers_of(page).collect()
    }

    #[test]
    fn allocate_page_stops_at_capacity() {
        let mut table = PageTable::new(4096, 2);
        assert_eq!(table.allocate_page().unwrap(), 0);
        assert_eq!(table.allocate_page().unwrap(), 1);
        assert!(matches!(
            table.allocate_page(),
            Err(DsmError::OutOfPages { max_pages: 2 })
        ));
        assert_eq!(table.pages_in_use(), 2);
    }

    #[test]
    fn reserve_is_first_fit_and_bounded() {
        let mut table = PageTable::new(1000, 4);
        let page = table.allocate_page().unwrap();
        assert_eq!(table.reserve(page, 300).unwrap(), 0);
        assert_eq!(table.reserve(page, 300).unwrap(), 300);
        assert_eq!(table.reserve(page, 400).unwrap(), 600);
        assert!(matches!(
            table.reserve(page, 1),
            Err(DsmError::PageFull { page: 0, requested: 1 })
        ));
        assert!(table.reserve(7, 10).is_err());
    }

    #[test]
    fn allocations_never_overlap_or_overflow() {
        let mut table = PageTable::new(4096, 64);
        let sizes = [800, 4000, 1, 4096, 17, 2048, 2048, 3, 999, 3000];
        for (i, size) in sizes.iter().enumerate() {
            table.allocate(NodeId((i % 3) as u8), *size).unwrap();
        }
        for page in 0..table.pages_in_use() {
            let allocations = table.allocations_on(page);
            let total: u32 = allocations.iter().map(|a| a.size).sum();
            assert!(total <= 4096);
            for pair in allocations.windows(2) {
                assert!(pair[0].offset + pair[0].size <= pair[1].offset);
            }
        }
    }

    #[test]
    fn oversized_allocation_rolls_to_fresh_page() {
        let mut table = PageTable::new(4096, 10);
        let first = table.allocate(NodeId(0), 800).unwrap();
        assert_eq!(first.global_offset(4096), 0);

        let second = table.allocate(NodeId(1), 4000).unwrap();
        assert_eq!(second.page, 1);
        assert_eq!(second.global_offset(4096), 4096);
        assert_eq!(table.writer_of(0), Some(NodeId(0)));
        assert_eq!(table.writer_of(1), Some(NodeId(1)));
    }

    #[test]
    fn node_keeps_filling_its_own_page() {
        let mut table = PageTable::new(4096, 10);
        let a = table.allocate(NodeId(0), 100).unwrap();
        let b = table.allocate(NodeId(0), 100).unwrap();
        assert_eq!((a.page, a.offset), (0, 0));
        assert_eq!((b.page, b.offset), (0, 100));

        // another node never lands on node 0's page
        let c = table.allocate(NodeId(1), 100).unwrap();
        assert_eq!(c.page, 1);
    }

    #[test]
    fn losing_write_ownership_moves_allocation_elsewhere() {
        let mut table = PageTable::new(4096, 10);
        table.allocate(NodeId(0), 100).unwrap();
        table.set_writer(0, NodeId(1)).unwrap();

        let next = table.allocate(NodeId(0), 100).unwrap();
        assert_eq!(next.page, 1);
        assert_eq!(table.writer_of(0), Some(NodeId(1)));
    }

    #[test]
    fn shared_page_is_not_reused() {
        let mut table = PageTable::new(4096, 10);
        table.allocate(NodeId(0), 100).unwrap();
        table.add_reader(0, NodeId(1)).unwrap();
        assert!(!table.is_exclusive(0, NodeId(0)));

        let next = table.allocate(NodeId(0), 100).unwrap();
        assert_eq!(next.page, 1);
        assert_eq!(readers(&table, 0), vec![NodeId(0), NodeId(1)]);
    }

    #[test]
    fn zero_and_oversized_requests_are_rejected() {
        let mut table = PageTable::new(4096, 10);
        assert!(matches!(
            table.allocate(NodeId(0), 0),
            Err(DsmError::PageFull { .. })
        ));
        assert!(table.allocate(NodeId(0), 4097).is_err());
        assert_eq!(table.pages_in_use(), 0);
    }

    #[test]
    fn set_writer_collapses_readers() {
        let mut table = PageTable::new(4096, 10);
        table.allocate(NodeId(0), 8).unwrap();
        table.add_reader(0, NodeId(1)).unwrap();
        table.add_reader(0, NodeId(2)).unwrap();
        assert_eq!(readers(&table, 0), vec![NodeId(0), NodeId(1), NodeId(2)]);

        table.set_writer(0, NodeId(2)).unwrap();
        assert_eq!(table.writer_of(0), Some(NodeId(2)));
        assert_eq!(readers(&table, 0), vec![NodeId(2)]);
    }

    #[test]
    fn forget_reader_keeps_writes() {
        let mut table = PageTable::new(4096, 10);
        table.allocate(NodeId(0), 8).unwrap();
        table.allocate(NodeId(1), 8).unwrap();
        table.add_reader(1, NodeId(0)).unwrap();

        table.forget_reader(NodeId(0));
        assert_eq!(readers(&table, 1), vec![NodeId(1)]);
        assert_eq!(table.writer_of(0), Some(NodeId(0)));
        assert_eq!(readers(&table, 0), vec![NodeId(0)]);
    }

    #[test]
    fn page_of_respects_capacity() {
        let table = PageTable::new(4096, 2);
        assert_eq!(table.page_of(0), Some(0));
        assert_eq!(table.page_of(4095), Some(0));
        assert_eq!(table.page_of(4096), Some(1));
        assert_eq!(table.page_of(8192), None);
        assert!(!table.is_allocated(0));
    }
}
