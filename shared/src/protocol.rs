use std::net::Ipv4Addr;

/// Hostname prefix marking names that can only be resolved via UPnP
pub const UPNP_ADDRESS_PREFIX: &str = "octoprint-via-upnp---";

/// DNS-SD service type announced by printer controllers
pub const CONTROLLER_SERVICE_TYPE: &str = "_octoprint._tcp.local.";

/// TXT record keys used to rebuild the controller URL
pub const TXT_PATH: &str = "path";
pub const TXT_USER: &str = "u";
pub const TXT_PASSWORD: &str = "p";

/// SSDP multicast group
pub const SSDP_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Builds the synthetic hostname for a UPnP device id
pub fn upnp_hostname(uuid: &str) -> String {
    format!("{}{}", UPNP_ADDRESS_PREFIX, uuid).to_lowercase()
}
