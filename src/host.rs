//! DNS collaborator. Resolution proper is out of scope; the only question
//! the scheduler asks is how many addresses back an endpoint, to gate the
//! virtual-IP estimate behind what DNS actually advertises.

use std::net::ToSocketAddrs;

pub trait HostResolver: Send + Sync {
    /// Number of addresses currently known for `host`; 0 when unknown.
    fn address_count(&self, host: &str) -> usize;
}

/// System-resolver default.
pub struct DefaultHostResolver;

impl HostResolver for DefaultHostResolver {
    fn address_count(&self, host: &str) -> usize {
        (host, 443u16)
            .to_socket_addrs()
            .map(|addrs| addrs.count())
            .unwrap_or(0)
    }
}

/// Fixed answer, for tests and deployments that skip the DNS gate.
pub struct FixedHostResolver(pub usize);

impl HostResolver for FixedHostResolver {
    fn address_count(&self, _host: &str) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_host_counts_zero() {
        let resolver = DefaultHostResolver;
        assert_eq!(resolver.address_count("host.invalid."), 0);
    }
}
