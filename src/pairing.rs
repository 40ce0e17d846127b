//! Relay of platform bond-state transitions to interested connection
//! attempts.

use crate::device::DeviceAddress;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Platform-level bond state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    NotBonded,
    Bonding,
    Bonded,
}

/// A bond-state transition reported by the platform, already demultiplexed
/// to one device.
#[derive(Debug, Clone, Copy)]
pub struct BondStateChange {
    pub device: DeviceAddress,
    pub previous: BondState,
    pub current: BondState,
}

/// What a bond-state transition means for a pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingEventKind {
    Started,
    Succeeded,
    Failed,
}

/// A pairing-related event for one device.
#[derive(Debug, Clone, Copy)]
pub struct PairingEvent {
    pub device: DeviceAddress,
    pub kind: PairingEventKind,
}

/// Translate a raw transition into a pairing event, if it represents one.
///
/// Only three transitions are meaningful; everything else (including bond
/// removal) is ignored.
fn translate(change: &BondStateChange) -> Option<PairingEventKind> {
    use BondState::*;
    match (change.previous, change.current) {
        (NotBonded, Bonding) => Some(PairingEventKind::Started),
        (Bonding, Bonded) => Some(PairingEventKind::Succeeded),
        (Bonding, NotBonded) => Some(PairingEventKind::Failed),
        _ => None,
    }
}

struct MonitorInner {
    listeners: Mutex<Vec<(u64, mpsc::UnboundedSender<PairingEvent>)>>,
    next_id: AtomicU64,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorInner {
    fn dispatch(&self, change: BondStateChange) {
        debug!(
            device = %change.device,
            "bond state change {:?} -> {:?}",
            change.previous,
            change.current
        );
        let Some(kind) = translate(&change) else {
            return;
        };
        let event = PairingEvent {
            device: change.device,
            kind,
        };
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|(_, tx)| tx.send(event).is_ok());
    }
}

/// Monitors and reports on pairing activity.
///
/// Fed by a platform stream of [`BondStateChange`]s via [`start`], fanned
/// out synchronously on receipt to every live [`PairingSubscription`].
/// [`stop`] is a full reset: it ends the relay and drops all subscribers.
///
/// [`start`]: PairingMonitor::start
/// [`stop`]: PairingMonitor::stop
#[derive(Clone)]
pub struct PairingMonitor {
    inner: Arc<MonitorInner>,
}

impl PairingMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                relay: Mutex::new(None),
            }),
        }
    }

    /// Start relaying from the provided bond-state source. Starting an
    /// already running monitor replaces its source.
    pub fn start(&self, source: impl Stream<Item = BondStateChange> + Send + 'static) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut source = std::pin::pin!(source);
            while let Some(change) = source.next().await {
                inner.dispatch(change);
            }
            debug!("bond state source ended");
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

    /// Register for pairing events. The subscription unregisters itself
    /// when dropped.
    pub fn subscribe(&self) -> PairingSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().unwrap().push((id, tx));
        PairingSubscription {
            monitor: Arc::downgrade(&self.inner),
            id,
            rx,
        }
    }
}

impl Default for PairingMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// A registration with a [`PairingMonitor`].
pub struct PairingSubscription {
    monitor: Weak<MonitorInner>,
    id: u64,
    rx: mpsc::UnboundedReceiver<PairingEvent>,
}

impl PairingSubscription {
    /// The next pairing event, or `None` once the monitor has been stopped
    /// or reset.
    pub async fn recv(&mut self) -> Option<PairingEvent> {
        self.rx.recv().await
    }
}

impl Drop for PairingSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const DEVICE: DeviceAddress = DeviceAddress::new([0, 1, 2, 3, 4, 5]);
    const OTHER: DeviceAddress = DeviceAddress::new([9, 9, 9, 9, 9, 9]);

    fn change(previous: BondState, current: BondState) -> BondStateChange {
        BondStateChange {
            device: DEVICE,
            previous,
            current,
        }
    }

    #[test]
    fn test_transition_table() {
        use BondState::*;
        assert_eq!(
            translate(&change(NotBonded, Bonding)),
            Some(PairingEventKind::Started)
        );
        assert_eq!(
            translate(&change(Bonding, Bonded)),
            Some(PairingEventKind::Succeeded)
        );
        assert_eq!(
            translate(&change(Bonding, NotBonded)),
            Some(PairingEventKind::Failed)
        );
        assert_eq!(translate(&change(Bonded, NotBonded)), None);
        assert_eq!(translate(&change(NotBonded, Bonded)), None);
        assert_eq!(translate(&change(Bonded, Bonded)), None);
    }

    #[tokio::test]
    async fn test_relays_pairing_flow_to_subscriber() {
        use BondState::*;
        let monitor = PairingMonitor::new();
        let mut subscription = monitor.subscribe();
        monitor.start(futures::stream::iter(vec![
            change(NotBonded, Bonding),
            BondStateChange {
                device: OTHER,
                previous: Bonded,
                current: NotBonded,
            },
            change(Bonding, Bonded),
        ]));

        let first = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.device, DEVICE);
        assert_eq!(first.kind, PairingEventKind::Started);

        let second = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.kind, PairingEventKind::Succeeded);
    }

    #[tokio::test]
    async fn test_stop_clears_subscribers() {
        let monitor = PairingMonitor::new();
        let mut subscription = monitor.subscribe();
        monitor.start(futures::stream::pending());
        monitor.stop();
        // The sender side is gone, so the subscription ends.
        let next = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let monitor = PairingMonitor::new();
        let subscription = monitor.subscribe();
        drop(subscription);
        assert!(monitor.inner.listeners.lock().unwrap().is_empty());
    }
}
