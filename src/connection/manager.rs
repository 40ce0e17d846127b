//! Registry of per-device connections and attempts.

use crate::config::ConnectionConfig;
use crate::connection::proxy::{ConnectionProxy, ProxyListener};
use crate::connection::task::ConnectTask;
use crate::device::DeviceAddress;
use crate::events::{AttemptSink, DeviceEvent};
use crate::pairing::PairingMonitor;
use crate::transport::Platform;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

struct ManagerShared {
    platform: Platform,
    pairing: PairingMonitor,
    /// Membership means "connected or connecting". Guards the
    /// at-most-one-attempt-per-device invariant.
    registry: Mutex<HashMap<DeviceAddress, Arc<ConnectionProxy>>>,
    device_listeners: Mutex<Vec<mpsc::UnboundedSender<DeviceEvent>>>,
}

impl ManagerShared {
    fn purge(&self, device: DeviceAddress) {
        self.registry.lock().unwrap().remove(&device);
    }

    fn fan_out(&self, event: DeviceEvent) {
        self.device_listeners
            .lock()
            .unwrap()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

impl ProxyListener for ManagerShared {
    fn on_connection_attempt_succeeded(&self, device: DeviceAddress) {
        // The device stays registered: it is now connected.
        debug!(device = %device, "connection attempt succeeded");
        self.fan_out(DeviceEvent::Connected { device });
    }

    fn on_connection_attempt_failed(&self, device: DeviceAddress) {
        debug!(device = %device, "connection attempt failed - purging management data");
        self.purge(device);
    }

    fn on_connection_attempt_cancelled(&self, device: DeviceAddress) {
        debug!(device = %device, "connection attempt cancelled - purging management data");
        self.purge(device);
    }

    fn on_connection_closed(&self, device: DeviceAddress, by_error: bool) {
        debug!(
            device = %device,
            "connection {}",
            if by_error { "terminated" } else { "closed" }
        );
        self.purge(device);
        self.fan_out(DeviceEvent::Disconnected { device, by_error });
    }
}

/// Manages connections to remote devices, guaranteeing at most one
/// connection or attempt per device at any time.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    pub fn new(platform: Platform, pairing: PairingMonitor) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                platform,
                pairing,
                registry: Mutex::new(HashMap::new()),
                device_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start an asynchronous connection attempt to `device`.
    ///
    /// Progress and the terminal outcome are delivered through `callback`,
    /// if one is provided. Returns false - without queueing anything - if
    /// the device is already connected or being connected to.
    pub fn connect(
        &self,
        device: DeviceAddress,
        config: ConnectionConfig,
        callback: Option<AttemptSink>,
    ) -> bool {
        let mut registry = self.shared.registry.lock().unwrap();
        if registry.contains_key(&device) {
            debug!(
                device = %device,
                "cannot attempt connection - already connected or connection in progress"
            );
            return false;
        }
        let listener: Arc<dyn ProxyListener> = self.shared.clone();
        let proxy = ConnectionProxy::new(device, callback, Arc::downgrade(&listener));
        let task = ConnectTask::new(
            device,
            config,
            self.shared.platform.clone(),
            self.shared.pairing.clone(),
        );
        registry.insert(device, proxy.clone());
        debug!(device = %device, "starting asynchronous connection attempt");
        proxy.connect(task);
        true
    }

    /// Disconnect `device`, closing its connection or cancelling its
    /// in-flight attempt. Returns false if the device is not being
    /// managed. Disconnection completes asynchronously; subscribe to
    /// device events to observe it.
    pub fn disconnect(&self, device: DeviceAddress) -> bool {
        let Some(proxy) = self.proxy_for(device) else {
            debug!(device = %device, "cannot disconnect - connection is not being managed");
            return false;
        };
        proxy.disconnect();
        true
    }

    /// Disconnect every device currently connected or being connected to.
    ///
    /// Point-in-time: connects started after the registry snapshot are
    /// unaffected. Does nothing while the adapter is disabled.
    pub async fn disconnect_all(&self) {
        if !self.shared.platform.adapter.is_enabled().await {
            debug!("cannot disconnect all devices - adapter is disabled");
            return;
        }
        let devices: Vec<DeviceAddress> = {
            let registry = self.shared.registry.lock().unwrap();
            registry.keys().copied().collect()
        };
        for device in devices {
            self.disconnect(device);
        }
    }

    /// Whether `device` has an established, open connection.
    pub fn is_connected(&self, device: DeviceAddress) -> bool {
        self.proxy_for(device)
            .map(|proxy| proxy.is_connected())
            .unwrap_or(false)
    }

    /// Whether `device` is connected or has an attempt in flight.
    pub fn is_connected_or_connecting(&self, device: DeviceAddress) -> bool {
        self.shared.registry.lock().unwrap().contains_key(&device)
    }

    /// Register for device connected/disconnected events. Dropping the
    /// receiver unregisters.
    pub fn subscribe_device_events(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.device_listeners.lock().unwrap().push(tx);
        rx
    }

    fn proxy_for(&self, device: DeviceAddress) -> Option<Arc<ConnectionProxy>> {
        self.shared.registry.lock().unwrap().get(&device).cloned()
    }
}
