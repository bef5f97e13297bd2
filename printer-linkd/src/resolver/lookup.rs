use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use futures::future::join_all;
use mdns_sd::ServiceDaemon;
use tokio::net::TcpStream;
use crate::cache::DnsCache;
use crate::config::ResolverConfig;
use crate::discovery::{race, ssdp::SsdpCollector};
use crate::error::{LinkError, Result};
use super::backup;

/// Network operations the resolver depends on
#[async_trait]
pub trait NameLookup: Send + Sync {
    /// Platform resolver
    async fn system(&self, hostname: &str) -> Result<Vec<IpAddr>>;

    /// Multicast lookup for `.local` and `.home` names
    async fn multicast(&self, hostname: &str) -> Result<Vec<IpAddr>>;

    /// Direct queries against likely local DNS servers
    async fn backup(&self, hostname: &str) -> Result<Vec<IpAddr>>;

    /// SSDP search for a synthetic UPnP hostname
    async fn upnp(&self, hostname: &str) -> Result<Vec<IpAddr>>;

    /// True if any address accepts or actively refuses a TCP connection
    async fn is_reachable(&self, addresses: &[IpAddr]) -> bool;
}

/// [`NameLookup`] backed by the real network
pub struct NetworkLookup {
    cache: DnsCache,
    config: ResolverConfig,
    service_types: Vec<String>,
    ssdp: SsdpCollector,
}

impl NetworkLookup {
    pub fn new(cache: DnsCache, config: ResolverConfig, service_types: Vec<String>) -> Self {
        Self {
            cache,
            config,
            service_types,
            ssdp: SsdpCollector::new(),
        }
    }

    fn backup_servers(&self) -> Vec<std::net::Ipv4Addr> {
        backup::candidate_servers(
            self.config.gateway,
            self.config.dhcp_server,
            &self.config.extra_dns_servers,
            &backup::local_ipv4_addresses(),
        )
    }
}

#[async_trait]
impl NameLookup for NetworkLookup {
    async fn system(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((hostname, 0)).await.map_err(|e| {
            tracing::debug!("System lookup for {} failed: {}", hostname, e);
            LinkError::resolution(hostname)
        })?;

        let mut seen = HashSet::new();
        let addresses: Vec<IpAddr> = addrs
            .map(|a| a.ip())
            .filter(|ip| seen.insert(*ip))
            .collect();
        if addresses.is_empty() {
            return Err(LinkError::resolution(hostname));
        }
        Ok(addresses)
    }

    async fn multicast(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        // Dedicated daemon so the lookup does not disturb long-running browses
        let daemon = ServiceDaemon::new().map_err(|e| {
            tracing::warn!("Failed to start mDNS daemon: {}", e);
            LinkError::resolution(hostname)
        })?;
        let start = Instant::now();
        let result = race::mdns_lookup(
            &daemon,
            self.cache.clone(),
            hostname,
            &self.service_types,
            self.config.lookup_timeout(),
        )
        .await;
        tracing::debug!("Multicast lookup for {} took {:?}", hostname, start.elapsed());

        if let Err(e) = daemon.shutdown() {
            tracing::debug!("Failed to shut down lookup daemon: {}", e);
        }
        result
    }

    async fn backup(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let start = Instant::now();
        let result = backup::query(hostname, &self.backup_servers(), self.config.lookup_timeout()).await;
        tracing::debug!("Backup lookup for {} took {:?}", hostname, start.elapsed());
        result
    }

    async fn upnp(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let start = Instant::now();
        let result = race::upnp_lookup(
            &self.ssdp,
            self.cache.clone(),
            hostname,
            self.config.lookup_timeout(),
        )
        .await;
        tracing::debug!("UPnP lookup for {} took {:?}", hostname, start.elapsed());
        result
    }

    async fn is_reachable(&self, addresses: &[IpAddr]) -> bool {
        let port = self.config.probe_port;
        let timeout = self.config.probe_timeout();
        let probes = addresses
            .iter()
            .map(|ip| probe(SocketAddr::new(*ip, port), timeout));
        join_all(probes).await.into_iter().any(|reachable| reachable)
    }
}

/// A refused connection still proves the host is there
async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => true,
        Ok(Err(e)) => {
            tracing::debug!("Probe of {} failed: {}", addr, e);
            false
        }
        Err(_) => false,
    }
}
