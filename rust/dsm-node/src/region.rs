use std::collections::HashMap;

use bytes::Bytes;

/// Local access to a cached page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug)]
struct LocalPage {
    access: Access,
    bytes: Vec<u8>,
}

/// This node's copies of shared pages.
///
/// A missing page or a read-only page on write is a miss; the caller turns
/// it into a fault.
#[derive(Debug)]
pub struct Region {
    page_size: u32,
    pages: HashMap<u32, LocalPage>,
}

impl Region {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            pages: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn access(&self, page: u32) -> Option<Access> {
        self.pages.get(&page).map(|p| p.access)
    }

    /// Replace the local copy of `page`.
    pub fn install(&mut self, page: u32, contents: Bytes, access: Access) {
        let mut bytes = contents.to_vec();
        bytes.resize(self.page_size as usize, 0);
        self.pages.insert(page, LocalPage { access, bytes });
    }

    /// Take write access to a page this node was just allocated on.
    /// A page not cached yet is brand new and starts zeroed.
    pub fn claim(&mut self, page: u32) {
        let page_size = self.page_size as usize;
        self.pages
            .entry(page)
            .or_insert_with(|| LocalPage {
                access: Access::ReadWrite,
                bytes: vec![0; page_size],
            })
            .access = Access::ReadWrite;
    }

    pub fn downgrade(&mut self, page: u32) {
        if let Some(p) = self.pages.get_mut(&page) {
            p.access = Access::ReadOnly;
        }
    }

    /// Drop the local copy. Returns whether one existed.
    pub fn evict(&mut self, page: u32) -> bool {
        self.pages.remove(&page).is_some()
    }

    pub fn snapshot(&self, page: u32) -> Option<Bytes> {
        self.pages.get(&page).map(|p| Bytes::copy_from_slice(&p.bytes))
    }

    /// Copy out `buf.len()` bytes at `at` within `page`. False on a miss.
    pub fn read(&self, page: u32, at: usize, buf: &mut [u8]) -> bool {
        match self.pages.get(&page) {
            Some(p) => {
                buf.copy_from_slice(&p.bytes[at..at + buf.len()]);
                true
            }
            None => false,
        }
    }

    /// Copy `data` in at `at` within `page`. False unless the page is writable.
    pub fn write(&mut self, page: u32, at: usize, data: &[u8]) -> bool {
        match self.pages.get_mut(&page) {
            Some(p) if p.access == Access::ReadWrite => {
                p.bytes[at..at + data.len()].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_page_is_zeroed_and_writable() {
        let mut region = Region::new(64);
        region.claim(3);
        assert_eq!(region.access(3), Some(Access::ReadWrite));
        assert!(region.write(3, 8, &[1, 2, 3]));

        let mut buf = [0xFF; 4];
        assert!(region.read(3, 7, &mut buf));
        assert_eq!(buf, [0, 1, 2, 3]);
    }

    #[test]
    fn read_only_pages_refuse_writes() {
        let mut region = Region::new(16);
        region.install(0, Bytes::from_static(&[9; 16]), Access::ReadOnly);
        assert!(!region.write(0, 0, &[1]));

        let mut buf = [0; 2];
        assert!(region.read(0, 14, &mut buf));
        assert_eq!(buf, [9, 9]);
        assert!(!region.read(1, 0, &mut buf));
    }

    #[test]
    fn claim_keeps_existing_contents() {
        let mut region = Region::new(8);
        region.install(2, Bytes::from_static(&[5; 8]), Access::ReadOnly);
        region.claim(2);
        assert_eq!(region.access(2), Some(Access::ReadWrite));
        assert_eq!(region.snapshot(2).unwrap(), Bytes::from_static(&[5; 8]));
    }

    #[test]
    fn downgrade_and_evict() {
        let mut region = Region::new(8);
        region.claim(0);
        region.downgrade(0);
        assert_eq!(region.access(0), Some(Access::ReadOnly));
        assert!(region.evict(0));
        assert!(!region.evict(0));
        assert_eq!(region.access(0), None);
    }
}
