use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use crate::error::{LinkError, Result};

const FALLBACK_SERVERS: [Ipv4Addr; 3] = [
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 2, 1),
];

/// Non-loopback IPv4 addresses of the local interfaces
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to list interfaces: {}", e);
            Vec::new()
        }
    }
}

/// Candidate DNS servers in query order, without duplicates: gateway, DHCP
/// server, configured extras, each local address with its last octet set to
/// 1, then the common home-router addresses.
pub fn candidate_servers(
    gateway: Option<Ipv4Addr>,
    dhcp_server: Option<Ipv4Addr>,
    extra: &[Ipv4Addr],
    local: &[Ipv4Addr],
) -> Vec<Ipv4Addr> {
    let router_guesses = local.iter().map(|ip| {
        let [a, b, c, _] = ip.octets();
        Ipv4Addr::new(a, b, c, 1)
    });

    let mut servers: Vec<Ipv4Addr> = Vec::new();
    let all = gateway
        .into_iter()
        .chain(dhcp_server)
        .chain(extra.iter().copied())
        .chain(router_guesses)
        .chain(FALLBACK_SERVERS);
    for server in all {
        if !server.is_unspecified() && !servers.contains(&server) {
            servers.push(server);
        }
    }
    servers
}

/// Query `servers` directly for `hostname`, bypassing the system resolver
pub async fn query(hostname: &str, servers: &[Ipv4Addr], timeout: Duration) -> Result<Vec<IpAddr>> {
    if servers.is_empty() {
        return Err(LinkError::resolution(hostname));
    }

    let ips: Vec<IpAddr> = servers.iter().map(|s| IpAddr::V4(*s)).collect();
    let group = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
    let config = ResolverConfig::from_parts(None, Vec::new(), group);
    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 1;
    opts.cache_size = 0;

    let resolver = TokioAsyncResolver::tokio(config, opts);
    let fqdn = format!("{}.", hostname.trim_end_matches('.'));
    tracing::debug!("Querying {:?} for {}", servers, fqdn);

    match resolver.lookup_ip(fqdn.as_str()).await {
        Ok(lookup) => {
            let addresses: Vec<IpAddr> = lookup.iter().collect();
            if addresses.is_empty() {
                Err(LinkError::resolution(hostname))
            } else {
                Ok(addresses)
            }
        }
        Err(e) => {
            tracing::debug!("Backup DNS lookup for {} failed: {}", hostname, e);
            Err(LinkError::resolution(hostname))
        }
    }
}
