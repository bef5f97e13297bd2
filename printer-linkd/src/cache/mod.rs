//! In-memory DNS cache shared by the resolver and the discovery collectors.
//!
//! Each [`DnsCache`] owns its own map; clones share it. Writes are forwarded
//! to the persistence thread when one is attached.

pub mod db;
pub mod hash;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shared::types::{DiscoveredService, DnsCacheEntry};
use crate::cache_manager::PersistHandle;

#[derive(Clone)]
pub struct DnsCache {
    entries: Arc<RwLock<HashMap<String, DnsCacheEntry>>>,
    ttl: chrono::Duration,
    persist: Option<PersistHandle>,
}

/// Cache key for a hostname: lowercased, without trailing dot
pub fn cache_key(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_lowercase()
}

impl DnsCache {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            persist: None,
        }
    }

    /// Create a cache seeded with `initial` that writes through to `persist`
    pub fn with_persistence(
        ttl: chrono::Duration,
        persist: PersistHandle,
        initial: Vec<DnsCacheEntry>,
    ) -> Self {
        let entries = initial
            .into_iter()
            .filter(|e| !e.addresses.is_empty())
            .map(|e| {
                let key = cache_key(&e.hostname);
                (key.clone(), DnsCacheEntry { hostname: key, ..e })
            })
            .collect::<HashMap<_, _>>();
        tracing::info!("Loaded {} dns cache entries", entries.len());

        Self {
            entries: Arc::new(RwLock::new(entries)),
            ttl,
            persist: Some(persist),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Raw lookup, expired entries included
    pub fn get(&self, hostname: &str) -> Option<DnsCacheEntry> {
        self.entries.read().get(&cache_key(hostname)).cloned()
    }

    /// Lookup returning only entries still valid at `now`
    pub fn get_valid(&self, hostname: &str, now: DateTime<Utc>) -> Option<DnsCacheEntry> {
        self.get(hostname).filter(|e| e.is_valid_at(now))
    }

    /// Store `addresses` for `hostname`, valid for one TTL from now.
    /// Empty address lists are ignored.
    pub fn insert(&self, hostname: &str, addresses: Vec<IpAddr>) -> Option<DnsCacheEntry> {
        if addresses.is_empty() {
            tracing::warn!("Refusing to cache {} without addresses", hostname);
            return None;
        }
        let entry = DnsCacheEntry {
            hostname: cache_key(hostname),
            addresses,
            valid_until: self.next_valid_until(),
        };
        self.insert_entry(entry.clone());
        Some(entry)
    }

    pub fn insert_entry(&self, entry: DnsCacheEntry) {
        let key = cache_key(&entry.hostname);
        tracing::info!("Add to cache: {} -> {:?}", key, entry.addresses);
        self.entries
            .write()
            .insert(key.clone(), DnsCacheEntry { hostname: key, ..entry });
        self.persist();
    }

    /// Extend the validity of an existing entry by one TTL
    pub fn renew(&self, hostname: &str) -> Option<DnsCacheEntry> {
        let valid_until = self.next_valid_until();
        let renewed = {
            let mut entries = self.entries.write();
            entries.get_mut(&cache_key(hostname)).map(|entry| {
                entry.valid_until = valid_until;
                entry.clone()
            })
        };
        if renewed.is_some() {
            self.persist();
        }
        renewed
    }

    pub fn evict(&self, hostname: &str) -> Option<DnsCacheEntry> {
        let removed = self.entries.write().remove(&cache_key(hostname));
        if removed.is_some() {
            tracing::info!("Evicted {} from cache", hostname);
            self.persist();
        }
        removed
    }

    /// Seed the cache from a discovery announcement
    pub fn add_discovered(&self, service: &DiscoveredService) {
        self.insert(&service.hostname, vec![service.address]);
    }

    /// All entries, sorted by hostname
    pub fn entries(&self) -> Vec<DnsCacheEntry> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_valid_until(&self) -> DateTime<Utc> {
        Utc::now() + self.ttl
    }

    fn persist(&self) {
        if let Some(persist) = &self.persist {
            persist.persist(self.entries());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use shared::types::DiscoverySource;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_single_entry_per_lowercased_hostname() {
        let cache = DnsCache::new(chrono::Duration::seconds(600));
        cache.insert("Printer.Local", vec![addr(1)]);
        cache.insert("printer.local.", vec![addr(2)]);

        assert_eq!(cache.len(), 1);
        let entry = cache.get("PRINTER.local").unwrap();
        assert_eq!(entry.hostname, "printer.local");
        assert_eq!(entry.addresses, vec![addr(2)]);
    }

    #[test]
    fn test_empty_addresses_not_cached() {
        let cache = DnsCache::new(chrono::Duration::seconds(600));
        assert!(cache.insert("printer.local", Vec::new()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_valid_skips_expired() {
        let cache = DnsCache::new(chrono::Duration::seconds(600));
        cache.insert_entry(DnsCacheEntry {
            hostname: "old.local".to_string(),
            addresses: vec![addr(3)],
            valid_until: Utc::now() - chrono::Duration::seconds(1),
        });

        assert!(cache.get_valid("old.local", Utc::now()).is_none());
        assert!(cache.get("old.local").is_some());
    }

    #[test]
    fn test_renew_extends_validity() {
        let cache = DnsCache::new(chrono::Duration::seconds(600));
        cache.insert_entry(DnsCacheEntry {
            hostname: "old.local".to_string(),
            addresses: vec![addr(3)],
            valid_until: Utc::now() - chrono::Duration::seconds(1),
        });

        let renewed = cache.renew("old.local").unwrap();
        assert!(renewed.valid_until > Utc::now() + chrono::Duration::seconds(590));
        assert!(cache.get_valid("old.local", Utc::now()).is_some());
    }

    #[test]
    fn test_add_discovered_service() {
        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let service = DiscoveredService {
            label: "OctoPrint on octopi".to_string(),
            hostname: "octopi.local".to_string(),
            address: addr(50),
            port: 80,
            web_url: "http://octopi.local:80/".to_string(),
            source: DiscoverySource::DnsSd,
            upnp_id: None,
        };
        cache.add_discovered(&service);

        assert_eq!(cache.get("octopi.local").unwrap().addresses, vec![addr(50)]);
    }

    #[test]
    fn test_clones_share_state_but_instances_do_not() {
        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let clone = cache.clone();
        let other = DnsCache::new(chrono::Duration::seconds(600));

        clone.insert("a.local", vec![addr(1)]);
        assert!(cache.get("a.local").is_some());
        assert!(other.get("a.local").is_none());
    }
}
