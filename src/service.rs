//! The top-level service context.

use crate::config::ConnectionConfig;
use crate::connection::ConnectionManager;
use crate::device::DeviceAddress;
use crate::events::{AdapterStatusEvent, AttemptSink, DeviceEvent};
use crate::pairing::{BondStateChange, PairingMonitor};
use crate::status::AdapterStatusMonitor;
use crate::transport::Platform;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::info;

/// All-in-one device connection service.
///
/// Constructed once at process startup from the [`Platform`] capabilities
/// and passed by reference to every consumer - there is no global
/// instance. Owns the pairing and adapter-status monitors and the
/// connection manager, and exposes the whole connection surface in one
/// place.
pub struct Tether {
    platform: Platform,
    pairing: PairingMonitor,
    status: AdapterStatusMonitor,
    manager: ConnectionManager,
}

impl Tether {
    /// Build the service from the platform capabilities. The monitors are
    /// idle until [`start`] wires them to the platform's event streams.
    ///
    /// [`start`]: Tether::start
    pub fn new(platform: Platform) -> Self {
        let pairing = PairingMonitor::new();
        let status = AdapterStatusMonitor::new();
        let manager = ConnectionManager::new(platform.clone(), pairing.clone());
        Self {
            platform,
            pairing,
            status,
            manager,
        }
    }

    /// Wire the platform's bond-state and adapter-power streams into the
    /// monitors and start relaying.
    pub fn start(
        &self,
        bond_states: impl Stream<Item = BondStateChange> + Send + 'static,
        adapter_states: impl Stream<Item = bool> + Send + 'static,
    ) {
        info!("device connection service starting");
        self.pairing.start(bond_states);
        self.status.start(adapter_states);
    }

    /// Disconnect everything and stop the monitors, clearing their
    /// subscribers.
    pub async fn shutdown(&self) {
        info!("device connection service shutting down");
        self.manager.disconnect_all().await;
        self.pairing.stop();
        self.status.stop();
    }

    /// See [`ConnectionManager::connect`].
    pub fn connect(
        &self,
        device: DeviceAddress,
        config: ConnectionConfig,
        callback: Option<AttemptSink>,
    ) -> bool {
        self.manager.connect(device, config, callback)
    }

    /// See [`ConnectionManager::disconnect`].
    pub fn disconnect(&self, device: DeviceAddress) -> bool {
        self.manager.disconnect(device)
    }

    /// See [`ConnectionManager::disconnect_all`].
    pub async fn disconnect_all(&self) {
        self.manager.disconnect_all().await;
    }

    pub fn is_connected(&self, device: DeviceAddress) -> bool {
        self.manager.is_connected(device)
    }

    pub fn is_connected_or_connecting(&self, device: DeviceAddress) -> bool {
        self.manager.is_connected_or_connecting(device)
    }

    /// Whether the adapter is currently enabled.
    pub async fn is_adapter_enabled(&self) -> bool {
        self.platform.adapter.is_enabled().await
    }

    /// Devices bonded with the local adapter.
    pub async fn paired_devices(&self) -> Vec<DeviceAddress> {
        self.platform.directory.bonded_devices().await
    }

    /// Register for device connected/disconnected events.
    pub fn subscribe_device_events(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        self.manager.subscribe_device_events()
    }

    /// Register for adapter enabled/disabled events.
    pub fn subscribe_adapter_status(&self) -> mpsc::UnboundedReceiver<AdapterStatusEvent> {
        self.status.subscribe()
    }
}
