//! Per-host endpoint: the holder of one host's connection manager, plus
//! the table entry whose reference count ties endpoint lifetime to the
//! client's endpoint table.

use std::sync::Arc;

use crate::http::HttpConnectionManager;

pub struct Endpoint {
    host: String,
    manager: Arc<dyn HttpConnectionManager>,
    /// DNS address count sampled at creation; gates the VIP estimate.
    address_count: usize,
}

impl Endpoint {
    pub fn new(host: &str, manager: Arc<dyn HttpConnectionManager>, address_count: usize) -> Self {
        Self {
            host: host.to_string(),
            manager,
            address_count,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn manager(&self) -> &Arc<dyn HttpConnectionManager> {
        &self.manager
    }

    pub fn address_count(&self) -> usize {
        self.address_count
    }
}

/// Endpoint table entry. The count is a plain usize on purpose: it lives
/// inside the client's synced state and may only be read or written while
/// the client lock is held, which makes acquire-or-create and
/// release-and-remove transactional with the table lookup itself.
pub(crate) struct EndpointEntry {
    pub endpoint: Arc<Endpoint>,
    pub ref_count: usize,
}

impl EndpointEntry {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint, ref_count: 0 }
    }
}
