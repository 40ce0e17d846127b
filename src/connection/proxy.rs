//! Per-device facade binding one connection attempt to its owner and the
//! manager.

use crate::connection::stream::Connection;
use crate::connection::task::{ConnectObserver, ConnectTask};
use crate::device::DeviceAddress;
use crate::events::{AttemptSink, ConnectionAttemptEvent};
use crate::sync::CancelToken;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Internal listener for connection lifecycle events, implemented by the
/// manager. Non-owning: the proxy only ever holds it weakly.
pub(crate) trait ProxyListener: Send + Sync {
    fn on_connection_attempt_succeeded(&self, device: DeviceAddress);
    fn on_connection_attempt_failed(&self, device: DeviceAddress);
    fn on_connection_attempt_cancelled(&self, device: DeviceAddress);
    fn on_connection_closed(&self, device: DeviceAddress, by_error: bool);
}

struct ProxyState {
    started: bool,
    /// Cancel token of the in-flight attempt; cleared once it settles.
    attempt: Option<CancelToken>,
    /// The established connection; set on success, cleared on close.
    connection: Option<Connection>,
}

/// Owns the lifecycle of one device's connection: runs the attempt,
/// manages the resulting [`Connection`], reports internally to the
/// manager's [`ProxyListener`] and externally through the caller's
/// attempt channel.
pub(crate) struct ConnectionProxy {
    device: DeviceAddress,
    callback: Option<AttemptSink>,
    listener: Weak<dyn ProxyListener>,
    weak_self: Weak<ConnectionProxy>,
    state: Mutex<ProxyState>,
}

impl ConnectionProxy {
    pub(crate) fn new(
        device: DeviceAddress,
        callback: Option<AttemptSink>,
        listener: Weak<dyn ProxyListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            device,
            callback,
            listener,
            weak_self: weak_self.clone(),
            state: Mutex::new(ProxyState {
                started: false,
                attempt: None,
                connection: None,
            }),
        })
    }

    /// Whether the managed connection is established and open, checked
    /// live against the connection itself.
    pub(crate) fn is_connected(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .connection
            .as_ref()
            .map(Connection::is_open)
            .unwrap_or(false)
    }

    /// Start the connection attempt on the worker pool. Calling this a
    /// second time on the same proxy has no effect.
    pub(crate) fn connect(self: &Arc<Self>, task: ConnectTask) {
        {
            let mut state = self.state.lock().unwrap();
            if state.started {
                return;
            }
            state.started = true;
            state.attempt = Some(task.cancel_token());
        }
        let observer: Arc<dyn ConnectObserver> = self.clone();
        tokio::spawn(task.run(observer));
    }

    /// Disconnect the device: close the connection if one is established,
    /// otherwise cancel the attempt if one is in flight.
    pub(crate) fn disconnect(&self) {
        debug!(device = %self.device, "cancel or disconnect requested");
        let (connection, attempt) = {
            let state = self.state.lock().unwrap();
            (state.connection.clone(), state.attempt.clone())
        };
        if let Some(connection) = connection {
            debug!(device = %self.device, "connection present - closing");
            connection.close();
        } else if let Some(attempt) = attempt {
            debug!(device = %self.device, "no connection present - cancelling attempt");
            attempt.cancel();
        }
    }

    fn send(&self, event: ConnectionAttemptEvent) {
        if let Some(callback) = &self.callback {
            // A caller that dropped its receiver simply stops hearing
            // about the attempt.
            let _ = callback.send(event);
        }
    }

    fn notify_listener(&self, notify: impl FnOnce(&dyn ProxyListener)) {
        if let Some(listener) = self.listener.upgrade() {
            notify(listener.as_ref());
        }
    }

    fn handle_connection_closed(&self, by_error: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.connection = None;
        }
        self.notify_listener(|listener| listener.on_connection_closed(self.device, by_error));
    }
}

impl ConnectObserver for ConnectionProxy {
    fn on_pairing_started(&self) {
        self.send(ConnectionAttemptEvent::PairingStarted {
            device: self.device,
        });
    }

    fn on_pairing_succeeded(&self) {
        self.send(ConnectionAttemptEvent::PairingSucceeded {
            device: self.device,
        });
    }

    fn on_pairing_failed(&self) {
        self.send(ConnectionAttemptEvent::PairingFailed {
            device: self.device,
        });
    }

    fn on_connection_succeeded(&self, connection: Connection) {
        let weak = self.weak_self.clone();
        connection.register_on_close(move |by_error| {
            if let Some(proxy) = weak.upgrade() {
                proxy.handle_connection_closed(by_error);
            }
        });
        {
            let mut state = self.state.lock().unwrap();
            state.connection = Some(connection.clone());
            state.attempt = None;
        }
        self.notify_listener(|listener| listener.on_connection_attempt_succeeded(self.device));
        self.send(ConnectionAttemptEvent::Succeeded {
            device: self.device,
            connection,
        });
    }

    fn on_connection_failed(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.attempt = None;
        }
        self.notify_listener(|listener| listener.on_connection_attempt_failed(self.device));
        self.send(ConnectionAttemptEvent::Failed {
            device: self.device,
        });
    }

    fn on_connection_cancelled(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.attempt = None;
        }
        self.notify_listener(|listener| listener.on_connection_attempt_cancelled(self.device));
        self.send(ConnectionAttemptEvent::Cancelled {
            device: self.device,
        });
    }
}
