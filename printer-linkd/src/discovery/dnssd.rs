use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use shared::protocol::{TXT_PASSWORD, TXT_PATH, TXT_USER};
use shared::types::{DiscoveredService, DiscoverySource};
use crate::cache::{cache_key, DnsCache};
use crate::error::{LinkError, Result};

type RecvResult = (usize, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of its receiver so the set can be polled
/// without borrowing the receivers.
fn make_recv_future(idx: usize, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

/// Browse `service_types` and report every resolved instance.
///
/// Resolved instances are written into `cache` before being sent on `tx`.
/// Runs until `cancel` fires, `tx` is closed or every browse ends; all
/// browses are stopped on the way out.
pub async fn run_browser(
    daemon: ServiceDaemon,
    service_types: &[String],
    cache: DnsCache,
    tx: mpsc::Sender<DiscoveredService>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut browsing = Vec::new();
    let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

    for service_type in service_types {
        match daemon.browse(service_type) {
            Ok(receiver) => {
                tracing::info!("Browsing for {}", service_type);
                type_futures.push(make_recv_future(browsing.len(), receiver));
                browsing.push(service_type.clone());
            }
            Err(e) => {
                tracing::error!("Failed to browse {}: {}", service_type, e);
            }
        }
    }

    if browsing.is_empty() {
        return Err(LinkError::ConnectionIo("no dns-sd browse could be started".to_string()));
    }

    loop {
        tokio::select! {
            next = type_futures.next() => {
                let Some((idx, rx, result)) = next else {
                    tracing::warn!("All dns-sd browses ended");
                    break;
                };
                match result {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if let Some(service) = convert_service_info(&info) {
                            tracing::debug!("Resolved {} at {}", service.label, service.address);
                            cache.add_discovered(&service);
                            if tx.send(service).await.is_err() {
                                tracing::debug!("DNS-SD consumer went away");
                                break;
                            }
                        }
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(ServiceEvent::ServiceRemoved(_ty, fullname)) => {
                        tracing::debug!("Service removed: {}", fullname);
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(_) => {
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Err(e) => {
                        tracing::warn!("Browse of {} disconnected: {}", browsing[idx], e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::debug!("DNS-SD browser cancelled");
                break;
            }
        }
    }

    for service_type in &browsing {
        if let Err(e) = daemon.stop_browse(service_type) {
            tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
        }
    }

    Ok(())
}

/// Build the controller web URL from a resolved instance
pub fn controller_url(
    host: &str,
    port: u16,
    path: Option<&str>,
    user: Option<&str>,
    password: Option<&str>,
) -> String {
    let credentials = match (user, password) {
        (Some(u), Some(p)) if !u.is_empty() => format!("{}:{}@", u, p),
        (Some(u), None) if !u.is_empty() => format!("{}@", u),
        _ => String::new(),
    };
    let path = match path {
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{}", p),
        None => "/".to_string(),
    };
    format!("http://{}{}:{}{}", credentials, host, port, path)
}

/// Convert a resolved mdns-sd instance. IPv4 addresses are preferred.
pub fn convert_service_info(info: &ServiceInfo) -> Option<DiscoveredService> {
    let addresses = info.get_addresses();
    let address = addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied();

    let Some(address) = address else {
        tracing::debug!("Skipping {}, no addresses", info.get_fullname());
        return None;
    };

    let hostname = cache_key(info.get_hostname());
    let label = info
        .get_fullname()
        .trim_end_matches(info.get_type())
        .trim_end_matches('.')
        .to_string();

    Some(DiscoveredService {
        label,
        web_url: controller_url(
            &hostname,
            info.get_port(),
            info.get_property_val_str(TXT_PATH),
            info.get_property_val_str(TXT_USER),
            info.get_property_val_str(TXT_PASSWORD),
        ),
        hostname,
        address,
        port: info.get_port(),
        source: DiscoverySource::DnsSd,
        upnp_id: None,
    })
}

/// Whether `service` answers a lookup for `hostname`
pub(crate) fn matches_hostname(service: &DiscoveredService, hostname: &str) -> bool {
    service.hostname == cache_key(hostname)
}
