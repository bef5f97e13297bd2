//! Shared connection to the active printer controller.
//!
//! [`ConnectionProvider`] keeps exactly one transport for the active
//! [`DeviceConfig`] and replaces it only when the device's address or
//! credentials change. A single upstream subscription follows the current
//! transport and feeds the cached status and connectivity signals handed out
//! to any number of consumers.

pub mod status;

use std::sync::Arc;
use std::time::Duration;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::types::{ConnectedEvent, ControllerEvent, DeviceConfig, StatusMessage};
use crate::error::{LinkError, Result};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Client for one printer controller
pub trait ControllerClient: Send + Sync {
    fn web_url(&self) -> &str;

    /// Open a passive event subscription. The stream ends or yields an error
    /// when the underlying connection drops.
    fn events(&self) -> BoxStream<'static, Result<ControllerEvent>>;
}

pub type Transport = Arc<dyn ControllerClient>;

/// Builds a transport for a device
pub trait TransportFactory: Send + Sync {
    fn create(&self, device: &DeviceConfig) -> Result<Transport>;
}

#[derive(Clone)]
struct ConnectionHandle {
    device_id: String,
    fingerprint: String,
    transport: Transport,
}

fn same_transport(a: &Transport, b: &Transport) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// SHA-256 over the fields that identify a connection
pub fn fingerprint(device: &DeviceConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device.web_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(device.alternative_web_url.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"\n");
    hasher.update(device.api_key.as_bytes());
    hex::encode(hasher.finalize())
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    handle: Mutex<Option<ConnectionHandle>>,
    connection_tx: watch::Sender<Option<Transport>>,
    status_tx: watch::Sender<Option<StatusMessage>>,
    connectivity_tx: watch::Sender<Option<ConnectedEvent>>,
}

impl Inner {
    fn connection_for(&self, device: &DeviceConfig) -> Result<Transport> {
        let fingerprint = fingerprint(device);
        let mut handle = self.handle.lock();

        if let Some(current) = handle.as_mut() {
            // Cached status belongs to one device and never carries over
            if current.device_id != device.id {
                tracing::info!("Active device changed from {} to {}", current.device_id, device.id);
                self.status_tx.send_replace(None);
                self.connectivity_tx.send_replace(None);
                current.device_id = device.id.clone();
            }
            if current.fingerprint == fingerprint {
                return Ok(current.transport.clone());
            }
        }

        tracing::info!("Creating connection for {} ({})", device.id, device.web_url);
        let transport = self.factory.create(device)?;
        *handle = Some(ConnectionHandle {
            device_id: device.id.clone(),
            fingerprint,
            transport: transport.clone(),
        });
        self.connection_tx.send_replace(Some(transport.clone()));
        Ok(transport)
    }

    fn apply_device(&self, device: Option<DeviceConfig>) {
        match device {
            Some(device) => {
                if let Err(e) = self.connection_for(&device) {
                    tracing::error!("Failed to create connection for {}: {}", device.id, e);
                    self.clear();
                }
            }
            None => {
                tracing::info!("No active device, clearing connection");
                self.clear();
            }
        }
    }

    fn clear(&self) {
        *self.handle.lock() = None;
        self.connection_tx.send_replace(None);
        self.status_tx.send_replace(None);
        self.connectivity_tx.send_replace(None);
    }

    /// Apply an event from `source`. Events from a transport that has since
    /// been replaced are dropped.
    fn apply_event(&self, source: &Transport, event: ControllerEvent) {
        let handle = self.handle.lock();
        let current = handle
            .as_ref()
            .map_or(false, |h| same_transport(&h.transport, source));
        if !current {
            tracing::debug!("Dropping event from stale transport {}", source.web_url());
            return;
        }

        match event {
            ControllerEvent::Connected(connected) => {
                tracing::debug!("Controller connected: {:?}", connected.server_version);
                self.connectivity_tx.send_replace(Some(connected));
            }
            ControllerEvent::Disconnected { reason } => {
                tracing::debug!("Controller disconnected: {:?}", reason);
                self.connectivity_tx.send_replace(None);
            }
            ControllerEvent::Status(message) => {
                self.status_tx.send_modify(|current| {
                    let merged = status::merge(current.as_ref(), message);
                    *current = Some(merged);
                });
            }
            ControllerEvent::Other(_) => {}
        }
    }
}

pub struct ConnectionProvider {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl ConnectionProvider {
    /// Start following `devices`. Background tasks stop when the provider is
    /// dropped.
    pub fn new(factory: Arc<dyn TransportFactory>, devices: watch::Receiver<Option<DeviceConfig>>) -> Self {
        let (connection_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(None);
        let (connectivity_tx, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            factory,
            handle: Mutex::new(None),
            connection_tx,
            status_tx,
            connectivity_tx,
        });
        let cancel = CancellationToken::new();

        tokio::spawn(follow_devices(inner.clone(), devices, cancel.clone()));
        tokio::spawn(run_upstream(
            inner.clone(),
            inner.connection_tx.subscribe(),
            cancel.clone(),
        ));

        Self { inner, cancel }
    }

    /// The cached transport, recomputed whenever the active device changes
    pub fn current_connection_stream(&self) -> watch::Receiver<Option<Transport>> {
        self.inner.connection_tx.subscribe()
    }

    pub fn current_connection_or_fail(&self) -> Result<Transport> {
        self.inner
            .handle
            .lock()
            .as_ref()
            .map(|h| h.transport.clone())
            .ok_or(LinkError::NotAvailable)
    }

    /// Transport for `device`, reused while its fingerprint is unchanged
    pub fn connection_for(&self, device: &DeviceConfig) -> Result<Transport> {
        self.inner.connection_for(device)
    }

    /// Latest merged status, replayed to new subscribers
    pub fn passive_status_stream(&self, tag: &str) -> BoxStream<'static, StatusMessage> {
        tracing::debug!("[{}] subscribing to status", tag);
        cached_stream(self.inner.status_tx.subscribe())
    }

    /// Latest connected event, replayed to new subscribers
    pub fn passive_connectivity_stream(&self, tag: &str) -> BoxStream<'static, ConnectedEvent> {
        tracing::debug!("[{}] subscribing to connectivity", tag);
        cached_stream(self.inner.connectivity_tx.subscribe())
    }
}

impl Drop for ConnectionProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Current value first, then every change. Cleared states are skipped.
fn cached_stream<T>(rx: watch::Receiver<Option<T>>) -> BoxStream<'static, T>
where
    T: Clone + Send + Sync + 'static,
{
    stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first {
            rx.changed().await.ok()?;
        }
        let value = rx.borrow_and_update().clone();
        Some((value, (rx, false)))
    })
    .filter_map(|value| futures::future::ready(value))
    .boxed()
}

async fn follow_devices(
    inner: Arc<Inner>,
    mut devices: watch::Receiver<Option<DeviceConfig>>,
    cancel: CancellationToken,
) {
    loop {
        let device = devices.borrow_and_update().clone();
        inner.apply_device(device);

        tokio::select! {
            changed = devices.changed() => {
                if changed.is_err() {
                    tracing::debug!("Device config source closed");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// Single subscription to the current transport's events. Switches when the
/// transport changes and retries forever after failures.
async fn run_upstream(
    inner: Arc<Inner>,
    mut connections: watch::Receiver<Option<Transport>>,
    cancel: CancellationToken,
) {
    'transports: loop {
        let transport = connections.borrow_and_update().clone();
        let Some(transport) = transport else {
            let stop = tokio::select! {
                changed = connections.changed() => changed.is_err(),
                _ = cancel.cancelled() => true,
            };
            if stop {
                break;
            }
            continue;
        };

        tracing::info!("Subscribing to events from {}", transport.web_url());
        let mut events = transport.events();
        loop {
            let failure = tokio::select! {
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        inner.apply_event(&transport, event);
                        continue;
                    }
                    Some(Err(e)) => format!("{}", e),
                    None => "event stream ended".to_string(),
                },
                changed = connections.changed() => {
                    if changed.is_err() { break 'transports; }
                    continue 'transports;
                }
                _ = cancel.cancelled() => break 'transports,
            };

            tracing::warn!("Event subscription to {} failed: {}, retrying", transport.web_url(), failure);
            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {
                    events = transport.events();
                }
                changed = connections.changed() => {
                    if changed.is_err() { break 'transports; }
                    continue 'transports;
                }
                _ = cancel.cancelled() => break 'transports,
            }
        }
    }
    tracing::debug!("Upstream subscription stopped");
}
