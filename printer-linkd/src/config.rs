use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::CONTROLLER_SERVICE_TYPE;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// SQLite file backing the DNS cache. No persistence when unset.
    #[serde(default = "default_db_path")]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// TCP port used for reachability probes of expired entries
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_secs: u64,
    /// Entries expired for longer than this are pruned from the store at startup
    #[serde(default = "default_prune_after")]
    pub prune_after_secs: u64,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dhcp_server: Option<Ipv4Addr>,
    #[serde(default)]
    pub extra_dns_servers: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    #[serde(default = "default_ssdp_interval")]
    pub ssdp_interval_secs: u64,
    #[serde(default = "default_true")]
    pub passive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Webcam stream followed by the daemon, if any
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_resolution")]
    pub max_resolution: u32,
    #[serde(default = "default_max_buffer")]
    pub max_buffer_bytes: usize,
    #[serde(default = "default_read_chunk")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_dropped")]
    pub max_dropped_frames: usize,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_stream_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    /// Where overflowing buffers are dumped for inspection
    #[serde(default)]
    pub diagnostics_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_db_path() -> Option<PathBuf> {
    Some(PathBuf::from("/var/lib/printer-link/dns.db"))
}

fn default_ttl() -> u64 {
    600
}

fn default_probe_timeout() -> u64 {
    200
}

fn default_probe_port() -> u16 {
    80
}

fn default_lookup_timeout() -> u64 {
    3
}

fn default_prune_after() -> u64 {
    7 * 24 * 3600
}

fn default_service_types() -> Vec<String> {
    vec![CONTROLLER_SERVICE_TYPE.to_string()]
}

fn default_ssdp_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_resolution() -> u32 {
    u32::MAX
}

fn default_max_buffer() -> usize {
    10 * 1024 * 1024
}

fn default_read_chunk() -> usize {
    16 * 1024
}

fn default_pool_size() -> usize {
    3
}

fn default_max_dropped() -> usize {
    5
}

fn default_reconnect_attempts() -> u32 {
    2
}

fn default_backoff() -> u64 {
    2000
}

fn default_stream_timeout() -> u64 {
    10_000
}

fn default_stats_window() -> usize {
    20
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ttl_secs: default_ttl(),
            probe_timeout_ms: default_probe_timeout(),
            probe_port: default_probe_port(),
            lookup_timeout_secs: default_lookup_timeout(),
            prune_after_secs: default_prune_after(),
            gateway: None,
            dhcp_server: None,
            extra_dns_servers: Vec::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_types: default_service_types(),
            ssdp_interval_secs: default_ssdp_interval(),
            passive: default_true(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_resolution: default_max_resolution(),
            max_buffer_bytes: default_max_buffer(),
            read_chunk_bytes: default_read_chunk(),
            pool_size: default_pool_size(),
            max_dropped_frames: default_max_dropped(),
            reconnect_attempts: default_reconnect_attempts(),
            backoff_base_ms: default_backoff(),
            timeout_ms: default_stream_timeout(),
            stats_window: default_stats_window(),
            diagnostics_dir: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl ResolverConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

impl DiscoveryConfig {
    pub fn ssdp_interval(&self) -> Duration {
        Duration::from_secs(self.ssdp_interval_secs.max(1))
    }
}

impl StreamConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms * attempt as u64)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
