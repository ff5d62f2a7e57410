use serde::Serialize;

/// Counters collected over one run, reported when the session terminates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub nodes_served: u32,
    pub allocations: u64,
    pub bytes_allocated: u64,
    pub pages_in_use: u32,
    pub barriers: u64,
    pub broadcasts: u64,
    pub read_faults: u64,
    pub write_faults: u64,
    pub invalidations: u64,
    pub failed_requests: u64,
    pub dropped_messages: u64,
}
