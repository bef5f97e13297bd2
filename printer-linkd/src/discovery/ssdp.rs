//! UPnP/SSDP collector.
//!
//! Sends an `M-SEARCH` to the SSDP multicast group and reports every
//! responding device as a [`DiscoveredService`] with a synthetic
//! `octoprint-via-upnp---<uuid>` hostname. Each device is written into the
//! DNS cache before it is reported.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::protocol::{upnp_hostname, SSDP_ADDRESS, SSDP_PORT};
use shared::types::{DiscoveredService, DiscoverySource};
use crate::cache::DnsCache;
use crate::error::Result;

const LINE_END: &str = "\r\n";

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)usn:.*uuid:([\-0-9a-z]{36})").expect("uuid pattern is valid")
});

pub fn search_request() -> String {
    format!(
        "M-SEARCH * HTTP/1.1{le}\
         HOST: {addr}:{port}{le}\
         MAN: \"ssdp:discover\"{le}\
         MX: 1{le}\
         ST: ssdp:all{le}\
         {le}",
        le = LINE_END,
        addr = SSDP_ADDRESS,
        port = SSDP_PORT,
    )
}

#[derive(Debug, Clone)]
pub struct SsdpCollector {
    target: SocketAddr,
    search_interval: Option<Duration>,
}

impl Default for SsdpCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SsdpCollector {
    pub fn new() -> Self {
        Self {
            target: SocketAddr::new(IpAddr::V4(SSDP_ADDRESS), SSDP_PORT),
            search_interval: None,
        }
    }

    /// Send searches to `target` instead of the multicast group
    pub fn with_target(target: SocketAddr) -> Self {
        Self {
            target,
            search_interval: None,
        }
    }

    /// Repeat the search periodically instead of sending it once
    pub fn repeat_every(mut self, interval: Duration) -> Self {
        self.search_interval = Some(interval);
        self
    }

    /// Collect responses until `cancel` fires or `tx` is closed.
    /// The socket is closed when this returns.
    pub async fn run(
        &self,
        cache: DnsCache,
        tx: mpsc::Sender<DiscoveredService>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let bind = if self.target.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        tracing::info!("Searching for UPnP devices via {}", self.target);
        let request = search_request();
        socket.send_to(request.as_bytes(), self.target).await?;

        let repeat = self.search_interval.unwrap_or(Duration::from_secs(3600));
        let mut search_timer = tokio::time::interval_at(tokio::time::Instant::now() + repeat, repeat);
        let mut buffer = [0u8; 2048];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buffer) => {
                    let (size, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::debug!("SSDP receive failed: {}", e);
                            continue;
                        }
                    };
                    let text = String::from_utf8_lossy(&buffer[..size]);
                    if let Some(service) = parse_response(&text, from.ip()) {
                        tracing::debug!("Discovered UPnP device {}", service.hostname);
                        cache.add_discovered(&service);
                        if tx.send(service).await.is_err() {
                            tracing::debug!("SSDP consumer went away");
                            break;
                        }
                    }
                }

                _ = search_timer.tick(), if self.search_interval.is_some() => {
                    if let Err(e) = socket.send_to(request.as_bytes(), self.target).await {
                        tracing::warn!("Failed to repeat M-SEARCH: {}", e);
                    }
                }

                _ = cancel.cancelled() => {
                    tracing::debug!("SSDP collector cancelled");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Parse a search response into a service. Only `HTTP/1.1 200` responses
/// carrying a device UUID in their `USN` header qualify.
pub fn parse_response(response: &str, from: IpAddr) -> Option<DiscoveredService> {
    if !response.to_uppercase().starts_with("HTTP/1.1 200") {
        return None;
    }

    let uuid = match UUID_PATTERN.captures(response).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().to_string(),
        None => {
            tracing::debug!("No uuid in SSDP response from {}", from);
            return None;
        }
    };

    let hostname = upnp_hostname(&uuid);
    Some(DiscoveredService {
        label: format!("OctoPrint on {}", from),
        web_url: format!("http://{}:80/", hostname),
        hostname,
        address: from,
        port: 80,
        source: DiscoverySource::Upnp,
        upnp_id: Some(uuid),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "abcd1234-5678-90ab-cdef-1234567890ab";

    fn response(status: &str) -> String {
        format!(
            "{}\r\n\
             CACHE-CONTROL: max-age=1800\r\n\
             LOCATION: http://192.168.1.20:80/plugin/discovery/discovery.xml\r\n\
             ST: upnp:rootdevice\r\n\
             USN: uuid:{}::upnp:rootdevice\r\n\
             \r\n",
            status, UUID
        )
    }

    fn from() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn test_search_request_format() {
        let request = search_request();
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(request.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_ok_response() {
        let service = parse_response(&response("HTTP/1.1 200 OK"), from()).unwrap();
        assert_eq!(service.hostname, format!("octoprint-via-upnp---{}", UUID));
        assert_eq!(service.upnp_id.as_deref(), Some(UUID));
        assert_eq!(service.address, from());
        assert_eq!(service.source, DiscoverySource::Upnp);
    }

    #[test]
    fn test_parse_lowercases_hostname() {
        let text = response("HTTP/1.1 200 OK").replace(UUID, &UUID.to_uppercase());
        let service = parse_response(&text, from()).unwrap();
        assert_eq!(service.hostname, format!("octoprint-via-upnp---{}", UUID));
    }

    #[test]
    fn test_parse_case_insensitive_usn() {
        let text = response("HTTP/1.1 200 OK").replace("USN: uuid:", "usn: UUID:");
        assert!(parse_response(&text, from()).is_some());
    }

    #[test]
    fn test_parse_rejects_non_200() {
        assert!(parse_response(&response("HTTP/1.1 404 Not Found"), from()).is_none());
        assert!(parse_response(&response("NOTIFY * HTTP/1.1"), from()).is_none());
    }

    #[test]
    fn test_parse_rejects_missing_uuid() {
        let text = "HTTP/1.1 200 OK\r\nUSN: urn:schemas-upnp-org:device:Basic:1\r\n\r\n";
        assert!(parse_response(text, from()).is_none());
    }

    #[tokio::test]
    async fn test_collector_seeds_cache_and_reports() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = device.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (size, client) = device.recv_from(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..size]).starts_with("M-SEARCH"));
            device
                .send_to(response("HTTP/1.1 200 OK").as_bytes(), client)
                .await
                .unwrap();
        });

        let cache = DnsCache::new(chrono::Duration::seconds(600));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let collector = SsdpCollector::with_target(target);
        let task = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { collector.run(cache, tx, cancel).await })
        };

        let service = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(service.hostname, format!("octoprint-via-upnp---{}", UUID));

        let entry = cache.get(&service.hostname).unwrap();
        assert_eq!(entry.addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
