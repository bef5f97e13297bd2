//! One-shot lookups driven by the discovery collectors.
//!
//! Each lookup starts its collectors under a child cancellation token and
//! returns the first matching answer. The token is cancelled when the lookup
//! returns, so losing collectors stop and close their sockets.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use mdns_sd::{HostnameResolutionEvent, ServiceDaemon};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::types::DiscoveredService;
use crate::cache::{cache_key, DnsCache};
use crate::error::{LinkError, Result};
use super::dnssd::{self, matches_hostname};
use super::query;
use super::ssdp::SsdpCollector;

/// Wait for the first service reported on `rx` that matches `hostname`
async fn first_match(
    rx: &mut mpsc::Receiver<DiscoveredService>,
    hostname: &str,
) -> Option<Vec<IpAddr>> {
    while let Some(service) = rx.recv().await {
        if matches_hostname(&service, hostname) {
            return Some(vec![service.address]);
        }
    }
    None
}

/// Resolve a synthetic UPnP hostname by running an SSDP search until the
/// device with the matching UUID answers.
pub async fn upnp_lookup(
    collector: &SsdpCollector,
    cache: DnsCache,
    hostname: &str,
    timeout: Duration,
) -> Result<Vec<IpAddr>> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let (tx, mut rx) = mpsc::channel(16);

    let collector = collector.clone();
    let task_cancel = cancel.child_token();
    tokio::spawn(async move {
        if let Err(e) = collector.run(cache, tx, task_cancel).await {
            tracing::warn!("UPnP lookup collector failed: {}", e);
        }
    });

    match tokio::time::timeout(timeout, first_match(&mut rx, hostname)).await {
        Ok(Some(addresses)) => Ok(addresses),
        Ok(None) => Err(LinkError::resolution(hostname)),
        Err(_) => {
            tracing::debug!("UPnP lookup for {} timed out", hostname);
            Err(LinkError::resolution(hostname))
        }
    }
}

/// Resolve a `.local`/`.home` hostname by racing a multicast address query
/// against a DNS-SD browse of `service_types`.
pub async fn mdns_lookup(
    daemon: &ServiceDaemon,
    cache: DnsCache,
    hostname: &str,
    service_types: &[String],
    timeout: Duration,
) -> Result<Vec<IpAddr>> {
    mdns_lookup_via(daemon, cache, hostname, service_types, timeout, query::mdns_group()).await
}

/// `.local.` names go through the daemon's hostname resolver; anything else is
/// asked for directly at `group`.
async fn mdns_lookup_via(
    daemon: &ServiceDaemon,
    cache: DnsCache,
    hostname: &str,
    service_types: &[String],
    timeout: Duration,
    group: SocketAddr,
) -> Result<Vec<IpAddr>> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let fqdn = format!("{}.", cache_key(hostname));
    let via_daemon = fqdn.ends_with(".local.");

    let (tx, mut rx) = mpsc::channel(16);
    {
        let daemon = daemon.clone();
        let service_types = service_types.to_vec();
        let task_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = dnssd::run_browser(daemon, &service_types, cache, tx, task_cancel).await {
                tracing::debug!("DNS-SD lookup browse failed: {}", e);
            }
        });
    }

    let address_query = async {
        if via_daemon {
            return hostname_query(daemon, &fqdn, timeout).await;
        }
        match query::query_addresses(&fqdn, group).await {
            Ok(addresses) => Some(addresses),
            Err(e) => {
                tracing::debug!("Multicast address query for {} failed: {}", fqdn, e);
                None
            }
        }
    };
    let browse = first_match(&mut rx, hostname);

    let result = tokio::time::timeout(timeout, async {
        tokio::select! {
            Some(addresses) = address_query => Some(addresses),
            Some(addresses) = browse => Some(addresses),
            else => None,
        }
    })
    .await;

    if via_daemon {
        if let Err(e) = daemon.stop_resolve_hostname(&fqdn) {
            tracing::debug!("Failed to stop hostname query for {}: {}", fqdn, e);
        }
    }

    match result {
        Ok(Some(addresses)) => Ok(addresses),
        Ok(None) => Err(LinkError::resolution(hostname)),
        Err(_) => {
            tracing::debug!("Multicast lookup for {} timed out", hostname);
            Err(LinkError::resolution(hostname))
        }
    }
}

async fn hostname_query(daemon: &ServiceDaemon, fqdn: &str, timeout: Duration) -> Option<Vec<IpAddr>> {
    let receiver = match daemon.resolve_hostname(fqdn, Some(timeout.as_millis() as u64)) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("Hostname query for {} not started: {}", fqdn, e);
            return None;
        }
    };

    while let Ok(event) = receiver.recv_async().await {
        match event {
            HostnameResolutionEvent::AddressesFound(_, addresses) if !addresses.is_empty() => {
                return Some(sorted(addresses));
            }
            HostnameResolutionEvent::SearchTimeout(_) | HostnameResolutionEvent::SearchStopped(_) => {
                return None;
            }
            _ => {}
        }
    }
    None
}

/// IPv4 first, then by address, so results are stable
fn sorted(addresses: HashSet<IpAddr>) -> Vec<IpAddr> {
    let mut addresses: Vec<_> = addresses.into_iter().collect();
    addresses.sort_by_key(|a| (a.is_ipv6(), *a));
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::net::UdpSocket;

    const UUID: &str = "0f0e0d0c-0b0a-0908-0706-050403020100";

    #[test]
    fn test_sorted_prefers_ipv4() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9));
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let set: HashSet<_> = [v6, v4].into_iter().collect();
        assert_eq!(sorted(set), vec![v4, v6]);
    }

    #[tokio::test]
    async fn test_upnp_lookup_matches_uuid() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = device.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, client) = device.recv_from(&mut buf).await.unwrap();
            let other = "HTTP/1.1 200 OK\r\nUSN: uuid:ffffffff-ffff-ffff-ffff-ffffffffffff::upnp:rootdevice\r\n\r\n";
            device.send_to(other.as_bytes(), client).await.unwrap();
            let ours = format!("HTTP/1.1 200 OK\r\nUSN: uuid:{}::upnp:rootdevice\r\n\r\n", UUID);
            device.send_to(ours.as_bytes(), client).await.unwrap();
        });

        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let hostname = shared::protocol::upnp_hostname(UUID);
        let addresses = upnp_lookup(
            &SsdpCollector::with_target(target),
            cache.clone(),
            &hostname,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert!(cache.get(&hostname).is_some());
    }

    #[tokio::test]
    async fn test_upnp_lookup_times_out() {
        // Nobody answers on this socket
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();

        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let result = upnp_lookup(
            &SsdpCollector::with_target(target),
            cache,
            &shared::protocol::upnp_hostname(UUID),
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(LinkError::ResolutionFailure { .. })));
    }

    #[tokio::test]
    async fn test_upnp_lookup_stops_collector_once_answered() {
        const LATE_UUID: &str = "11111111-2222-3333-4444-555555555555";
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = device.local_addr().unwrap();
        let late = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, client) = device.recv_from(&mut buf).await.unwrap();
            let ours = format!("HTTP/1.1 200 OK\r\nUSN: uuid:{}::upnp:rootdevice\r\n\r\n", UUID);
            device.send_to(ours.as_bytes(), client).await.unwrap();

            tokio::time::sleep(Duration::from_millis(300)).await;
            let other = format!("HTTP/1.1 200 OK\r\nUSN: uuid:{}::upnp:rootdevice\r\n\r\n", LATE_UUID);
            let _ = device.send_to(other.as_bytes(), client).await;
        });

        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let hostname = shared::protocol::upnp_hostname(UUID);
        upnp_lookup(
            &SsdpCollector::with_target(target),
            cache.clone(),
            &hostname,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        late.await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get(&hostname).is_some());
        assert!(cache.get(&shared::protocol::upnp_hostname(LATE_UUID)).is_none());
    }

    async fn responder(addresses: Vec<Ipv4Addr>) -> SocketAddr {
        use hickory_proto::op::{Message, MessageType};
        use hickory_proto::rr::rdata::A;
        use hickory_proto::rr::{RData, Record};
        use hickory_proto::serialize::binary::BinEncodable;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, client) = socket.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..len]).unwrap();
            let name = query.queries()[0].name().clone();
            for address in addresses {
                let mut response = Message::new();
                response.set_id(query.id()).set_message_type(MessageType::Response);
                response.add_answer(Record::from_rdata(name.clone(), 120, RData::A(A(address))));
                let _ = socket.send_to(&response.to_vec().unwrap(), client).await;
            }
        });
        target
    }

    #[tokio::test]
    async fn test_home_name_queried_directly_first_answer_wins() {
        let first = Ipv4Addr::new(192, 168, 1, 42);
        let target = responder(vec![first, Ipv4Addr::new(192, 168, 1, 43)]).await;
        let daemon = ServiceDaemon::new().unwrap();

        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let addresses = mdns_lookup_via(
            &daemon,
            cache,
            "Printer.home",
            &[],
            Duration::from_secs(2),
            target,
        )
        .await
        .unwrap();

        assert_eq!(addresses, vec![IpAddr::V4(first)]);
        let _ = daemon.shutdown();
    }

    #[tokio::test]
    async fn test_home_name_without_answer_fails() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let daemon = ServiceDaemon::new().unwrap();

        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let result = mdns_lookup_via(
            &daemon,
            cache,
            "printer.home",
            &[],
            Duration::from_millis(200),
            silent.local_addr().unwrap(),
        )
        .await;

        assert!(matches!(result, Err(LinkError::ResolutionFailure { .. })));
        let _ = daemon.shutdown();
    }
}
