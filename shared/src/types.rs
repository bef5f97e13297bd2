use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A resolved hostname held by the DNS cache.
/// This is the canonical data model used by the resolver, the store and the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsCacheEntry {
    /// Lowercased hostname, e.g. "printer.local"
    pub hostname: String,

    /// Resolved addresses in resolution order, never empty
    pub addresses: Vec<IpAddr>,

    /// Entry must be revalidated after this point
    pub valid_until: DateTime<Utc>,
}

impl DnsCacheEntry {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until > now
    }
}

/// Which collector produced a [`DiscoveredService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoverySource {
    Upnp,
    DnsSd,
}

/// A device announcement seen on the local network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredService {
    /// Human readable name, e.g. the DNS-SD instance name
    pub label: String,

    /// Hostname without trailing dot. For UPnP devices this is the synthetic
    /// `octoprint-via-upnp---<uuid>` name.
    pub hostname: String,

    pub address: IpAddr,

    pub port: u16,

    /// URL the device's web interface is reachable under, credentials included
    pub web_url: String,

    pub source: DiscoverySource,

    /// Device UUID from the SSDP `USN` header
    pub upnp_id: Option<String>,
}

/// Connection settings of the active device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub web_url: String,
    pub alternative_web_url: Option<String>,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterState {
    pub text: String,
    pub operational: bool,
    pub printing: bool,
    pub paused: bool,
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub component: String,
    pub actual: f32,
    pub target: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub completion: Option<f32>,
    pub print_time_secs: Option<u64>,
    pub print_time_left_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub file_name: Option<String>,
    pub estimated_print_time_secs: Option<u64>,
}

/// Periodic status pushed by the controller. Any field may be missing from
/// an individual message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub state: Option<PrinterState>,
    pub temps: Vec<TemperatureReading>,
    pub progress: Option<JobProgress>,
    pub job: Option<JobInfo>,
    pub logs: Vec<String>,
    pub server_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedEvent {
    pub server_version: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Events produced by a controller's passive event subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerEvent {
    Connected(ConnectedEvent),
    Disconnected { reason: Option<String> },
    Status(StatusMessage),
    Other(String),
}
