//! Local-network discovery of printer controllers.
//!
//! Two collectors feed [`DiscoveredService`]s into the DNS cache: SSDP for
//! UPnP devices and DNS-SD for advertised `_octoprint._tcp` instances.
//! [`discover`] runs both and merges their output; [`race`] turns them into
//! one-shot hostname lookups for the resolver.

pub mod dnssd;
pub mod query;
pub mod race;
pub mod ssdp;

use std::collections::HashSet;
use mdns_sd::ServiceDaemon;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::types::DiscoveredService;
use crate::cache::DnsCache;
use crate::config::DiscoveryConfig;
use self::ssdp::SsdpCollector;

/// Run both collectors until `cancel` fires.
///
/// Services are deduplicated by web URL. The returned channel closes once
/// both collectors have stopped.
pub fn discover(
    daemon: ServiceDaemon,
    cache: DnsCache,
    config: &DiscoveryConfig,
    cancel: CancellationToken,
) -> mpsc::Receiver<DiscoveredService> {
    let ssdp = SsdpCollector::new().repeat_every(config.ssdp_interval());
    discover_with(ssdp, daemon, cache, config.service_types.clone(), cancel)
}

fn discover_with(
    ssdp: SsdpCollector,
    daemon: ServiceDaemon,
    cache: DnsCache,
    service_types: Vec<String>,
    cancel: CancellationToken,
) -> mpsc::Receiver<DiscoveredService> {
    let (raw_tx, mut raw_rx) = mpsc::channel::<DiscoveredService>(64);
    let (out_tx, out_rx) = mpsc::channel(64);

    {
        let cache = cache.clone();
        let tx = raw_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = ssdp.run(cache, tx, cancel).await {
                tracing::error!("SSDP collector failed: {}", e);
            }
        });
    }

    {
        let tx = raw_tx;
        tokio::spawn(async move {
            if let Err(e) = dnssd::run_browser(daemon, &service_types, cache, tx, cancel).await {
                tracing::error!("DNS-SD collector failed: {}", e);
            }
        });
    }

    tokio::spawn(async move {
        let mut seen = HashSet::new();
        while let Some(service) = raw_rx.recv().await {
            if !seen.insert(service.web_url.clone()) {
                continue;
            }
            tracing::info!("Discovered {} at {} ({:?})", service.label, service.web_url, service.source);
            if out_tx.send(service).await.is_err() {
                break;
            }
        }
    });

    out_rx
}
