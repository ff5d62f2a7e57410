use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use dsm_wire::NodeId;

use crate::DsmError;

/// Port the allocator listens on when none is configured.
pub const DEFAULT_PORT: u16 = 9243;

/// Default page size (one OS page on common hardware).
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default size of the page table.
pub const DEFAULT_MAX_PAGES: u32 = 1000;

/// Session configuration, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Number of worker nodes that must register before serving starts.
    pub total_nodes: usize,
    /// Address the listener binds to.
    pub listen: SocketAddr,
    /// Bytes per page.
    pub page_size: u32,
    /// Fixed capacity of the page table.
    pub max_pages: u32,
    /// Deadline on every blocking collective or fault wait. `None` blocks forever.
    pub wait_deadline: Option<Duration>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            total_nodes: 1,
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            wait_deadline: None,
        }
    }
}

impl AllocatorConfig {
    pub fn with_nodes(total_nodes: usize) -> Self {
        Self {
            total_nodes,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), DsmError> {
        if self.total_nodes == 0 || self.total_nodes > NodeId::MAX_NODES {
            return Err(DsmError::Config(format!(
                "node count must be between 1 and {}, got {}",
                NodeId::MAX_NODES,
                self.total_nodes
            )));
        }
        if self.page_size == 0 {
            return Err(DsmError::Config("page size must be non-zero".to_string()));
        }
        if self.max_pages == 0 {
            return Err(DsmError::Config("page table must hold at least one page".to_string()));
        }
        if (self.page_size as u64) * (self.max_pages as u64) > u32::MAX as u64 + 1 {
            return Err(DsmError::Config(format!(
                "{} pages of {} bytes exceed the 4 GiB shared region",
                self.max_pages, self.page_size
            )));
        }
        Ok(())
    }

    /// Size in bytes of the whole shared address space.
    pub fn region_len(&self) -> u64 {
        self.page_size as u64 * self.max_pages as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AllocatorConfig::default();
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.wait_deadline, None);
        config.validate().unwrap();
    }

    #[test]
    fn node_count_bounds() {
        assert!(AllocatorConfig::with_nodes(0).validate().is_err());
        assert!(AllocatorConfig::with_nodes(255).validate().is_ok());
        assert!(AllocatorConfig::with_nodes(256).validate().is_err());
    }

    #[test]
    fn rejects_empty_pages() {
        let config = AllocatorConfig {
            page_size: 0,
            ..AllocatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(DsmError::Config(_))));

        let config = AllocatorConfig {
            max_pages: 0,
            ..AllocatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn region_must_fit_offsets() {
        let config = AllocatorConfig {
            page_size: 1 << 20,
            max_pages: 1 << 13,
            ..AllocatorConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(AllocatorConfig::default().region_len(), 4096 * 1000);
    }
}
