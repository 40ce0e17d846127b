//! Relay of adapter power transitions to interested listeners.

use crate::events::AdapterStatusEvent;
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

struct StatusInner {
    listeners: Mutex<Vec<mpsc::UnboundedSender<AdapterStatusEvent>>>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

/// Monitors and reports on the enabled/disabled state of the local adapter.
///
/// Same shape as [`crate::pairing::PairingMonitor`]: fed by a platform
/// stream (`true` = enabled), fanned out to subscribers, fully reset by
/// [`stop`].
///
/// [`stop`]: AdapterStatusMonitor::stop
#[derive(Clone)]
pub struct AdapterStatusMonitor {
    inner: Arc<StatusInner>,
}

impl AdapterStatusMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                listeners: Mutex::new(Vec::new()),
                relay: Mutex::new(None),
            }),
        }
    }

    /// Start relaying from the provided power-state source. Starting an
    /// already running monitor replaces its source.
    pub fn start(&self, source: impl Stream<Item = bool> + Send + 'static) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut source = std::pin::pin!(source);
            while let Some(enabled) = source.next().await {
                let event = if enabled {
                    AdapterStatusEvent::Enabled
                } else {
                    AdapterStatusEvent::Disabled
                };
                debug!("adapter status change: {:?}", event);
                let mut listeners = inner.listeners.lock().unwrap();
                listeners.retain(|tx| tx.send(event).is_ok());
            }
            debug!("adapter status source ended");
        });
        let mut relay = self.inner.relay.lock().unwrap();
        if let Some(previous) = relay.replace(task) {
            previous.abort();
        }
    }

    /// Stop relaying and clear every registered subscriber.
    pub fn stop(&self) {
        if let Some(task) = self.inner.relay.lock().unwrap().take() {
            task.abort();
        }
        self.inner.listeners.lock().unwrap().clear();
    }

    /// Register for adapter status events. Dropping the receiver
    /// unregisters; dead receivers are pruned at the next fan-out.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AdapterStatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().unwrap().push(tx);
        rx
    }
}

impl Default for AdapterStatusMonitor {
    fn default() -> Self {
        Self::new()
    }
}
