//! Tiered hostname resolution.
//!
//! Lookups go through the DNS cache first. Expired entries are kept if a
//! quick TCP probe still reaches them. Misses fall through to the platform
//! resolver, then to multicast lookup for `.local`/`.home` names or to direct
//! queries against likely local DNS servers for everything else. Synthetic
//! UPnP hostnames are only ever resolved through the cache and SSDP.
//!
//! All resolution is serialized, so concurrent lookups of the same name
//! trigger at most one network lookup.

pub mod backup;
pub mod lookup;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::sync::Mutex;
use shared::protocol::UPNP_ADDRESS_PREFIX;
use crate::cache::{cache_key, DnsCache};
use crate::error::{LinkError, Result};
use self::lookup::NameLookup;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone)]
pub struct HostResolver {
    cache: DnsCache,
    lookup: Arc<dyn NameLookup>,
    serial: Arc<Mutex<()>>,
}

fn is_multicast_name(hostname: &str) -> bool {
    hostname.ends_with(".local") || hostname.ends_with(".home")
}

impl HostResolver {
    pub fn new(cache: DnsCache, lookup: Arc<dyn NameLookup>) -> Self {
        Self {
            cache,
            lookup,
            serial: Arc::new(Mutex::new(())),
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// HTTP client that resolves hosts through this resolver
    pub fn http_client(&self, connect_timeout: Duration) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .dns_resolver(Arc::new(self.clone()))
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(client)
    }

    /// Resolve `hostname` to one or more addresses.
    ///
    /// Fails with [`LinkError::ResolutionFailure`] once every applicable
    /// strategy has been tried.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let hostname = cache_key(hostname);
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let _serial = self.serial.lock().await;

        if let Some(addresses) = self.from_cache(&hostname).await {
            tracing::debug!("Resolved {} from cache", hostname);
            return Ok(addresses);
        }

        let start = Instant::now();
        let result = if hostname.starts_with(UPNP_ADDRESS_PREFIX) {
            self.lookup.upnp(&hostname).await
        } else {
            match self.lookup.system(&hostname).await {
                Ok(addresses) => Ok(addresses),
                Err(_) if is_multicast_name(&hostname) => self.lookup.multicast(&hostname).await,
                Err(_) => self.lookup.backup(&hostname).await,
            }
        };

        match result {
            Ok(addresses) if !addresses.is_empty() => {
                tracing::info!("Resolved {} to {:?} in {:?}", hostname, addresses, start.elapsed());
                self.cache.insert(&hostname, addresses.clone());
                Ok(addresses)
            }
            Ok(_) => {
                tracing::warn!("Unable to resolve {}", hostname);
                Err(LinkError::resolution(&hostname))
            }
            Err(e) => {
                tracing::warn!("Unable to resolve {}: {}", hostname, e);
                Err(LinkError::resolution(&hostname))
            }
        }
    }

    /// Valid entries are returned as-is. Expired entries are renewed if still
    /// reachable and evicted otherwise.
    async fn from_cache(&self, hostname: &str) -> Option<Vec<IpAddr>> {
        let entry = self.cache.get(hostname)?;
        if entry.is_valid_at(Utc::now()) {
            return Some(entry.addresses);
        }

        if self.lookup.is_reachable(&entry.addresses).await {
            tracing::debug!("{} expired but still reachable, renewing", hostname);
            self.cache.renew(hostname);
            Some(entry.addresses)
        } else {
            self.cache.evict(hostname);
            None
        }
    }
}

/// Lets HTTP clients resolve through the cache and local discovery
impl Resolve for HostResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let addresses = HostResolver::resolve(&resolver, name.as_str())
                .await
                .map_err(|e| -> BoxError { Box::new(e) })?;
            let addrs: Addrs = Box::new(addresses.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<Addrs, BoxError>(addrs)
        })
    }
}
