//! DHT bootstrap module
//!
//! Well-known entry points into the network, resolved on demand.

use std::net::SocketAddr;

use tokio::net::lookup_host;
use tracing::{debug, warn};

/// Hosts used when no others are configured
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Bootstrap configuration
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// `host:port` entries
    pub hosts: Vec<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            hosts: DEFAULT_BOOTSTRAP_NODES.iter().map(|h| h.to_string()).collect(),
        }
    }
}

impl BootstrapConfig {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    /// Resolve every host, skipping the ones that fail
    pub async fn resolve(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for host in &self.hosts {
            match lookup_host(host.as_str()).await {
                Ok(resolved) => {
                    let before = addrs.len();
                    addrs.extend(resolved.filter(|a: &SocketAddr| a.port() != 0));
                    debug!("Bootstrap host {} resolved to {} addresses", host, addrs.len() - before);
                }
                Err(e) => warn!("Failed to resolve bootstrap host {}: {}", host, e),
            }
        }
        addrs.sort();
        addrs.dedup();
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hosts() {
        assert_eq!(BootstrapConfig::default().hosts.len(), DEFAULT_BOOTSTRAP_NODES.len());
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let config = BootstrapConfig::new(vec![
            "127.0.0.1:6881".to_string(),
            "127.0.0.1:6881".to_string(),
            "not a host".to_string(),
        ]);
        assert_eq!(config.resolve().await, vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]);
    }
}
