use super::host::UpstreamHost;
use std::sync::Arc;

/// Fixed-order sequence of hosts. Order is stable for the lifetime of the
/// pool and is observable by policies (`first`, `round_robin`).
pub struct HostPool {
    hosts: Vec<Arc<UpstreamHost>>,
}

impl HostPool {
    pub fn new(hosts: Vec<Arc<UpstreamHost>>) -> Self {
        Self { hosts }
    }

    pub fn hosts(&self) -> &[Arc<UpstreamHost>] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn available_indices(&self) -> Vec<usize> {
        self.hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.available())
            .map(|(i, _)| i)
            .collect()
    }
}
