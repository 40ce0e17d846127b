//! The per-attempt connection state machine.

use crate::config::ConnectionConfig;
use crate::connection::stream::Connection;
use crate::device::DeviceAddress;
use crate::pairing::{PairingEvent, PairingEventKind, PairingMonitor, PairingSubscription};
use crate::retry::RetryPolicy;
use crate::sync::CancelToken;
use crate::transport::{Platform, TransportStream, FALLBACK_SERVICE_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long to wait between checks while a discovery scan blocks the
/// attempt.
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Callback surface for one connection attempt, implemented by the proxy
/// owning the attempt.
///
/// All calls arrive synchronously on the attempt's worker task; marshaling
/// onto any external context is the implementer's responsibility. Per
/// attempt there is at most one `on_pairing_started`, then optionally one
/// of `on_pairing_succeeded`/`on_pairing_failed`, then exactly one of the
/// three terminal calls.
pub(crate) trait ConnectObserver: Send + Sync {
    fn on_pairing_started(&self);
    fn on_pairing_succeeded(&self);
    fn on_pairing_failed(&self);
    fn on_connection_succeeded(&self, connection: Connection);
    fn on_connection_failed(&self);
    fn on_connection_cancelled(&self);
}

enum Outcome {
    Succeeded(Connection),
    Failed,
    Cancelled,
}

enum OpenError {
    Cancelled,
    Transport(anyhow::Error),
}

enum PairingResolution {
    Outcome(bool),
    Cancelled,
}

/// Pairing observations accumulated across the retries of one attempt.
#[derive(Default)]
struct PairingProgress {
    /// Whether pairing was seen to start. A transport failure before this
    /// point must not wait for a pairing outcome the platform will never
    /// deliver.
    started: bool,
    /// The recorded outcome, if one arrived.
    outcome: Option<bool>,
}

/// Drives a single connection attempt from first try through retries to a
/// terminal outcome.
///
/// Single use: created per connect request, run once on the worker pool,
/// discarded after reporting. Cancellation is cooperative through the
/// task's [`CancelToken`], observed at every suspension point; cancelling
/// while the transport open is in flight drops the open future, closing
/// the half-open handle.
pub(crate) struct ConnectTask {
    device: DeviceAddress,
    config: ConnectionConfig,
    policy: RetryPolicy,
    platform: Platform,
    pairing_monitor: PairingMonitor,
    cancel: CancelToken,
}

impl ConnectTask {
    pub(crate) fn new(
        device: DeviceAddress,
        config: ConnectionConfig,
        platform: Platform,
        pairing_monitor: PairingMonitor,
    ) -> Self {
        let policy = config.retry_policy();
        Self {
            device,
            config,
            policy,
            platform,
            pairing_monitor,
            cancel: CancelToken::new(),
        }
    }

    /// The token that cancels this attempt.
    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the attempt to completion, reporting progress and the terminal
    /// outcome through `observer`.
    pub(crate) async fn run(mut self, observer: Arc<dyn ConnectObserver>) {
        debug!(device = %self.device, "connect task starting up");
        let service = match self.config.service() {
            Some(service) => service,
            None => {
                let service = self
                    .platform
                    .directory
                    .suggested_service(self.device)
                    .await
                    .unwrap_or(FALLBACK_SERVICE_ID);
                debug!(device = %self.device, "no service identifier configured - trying {service}");
                service
            }
        };
        match self.attempt_loop(service, observer.as_ref()).await {
            Outcome::Succeeded(connection) => {
                debug!(device = %self.device, "connection succeeded");
                observer.on_connection_succeeded(connection);
            }
            Outcome::Failed => observer.on_connection_failed(),
            Outcome::Cancelled => {
                debug!(device = %self.device, "connection attempt cancelled");
                observer.on_connection_cancelled();
            }
        }
        // The pairing subscription, if one was taken, was dropped inside
        // attempt_loop - unregistering from the monitor on every exit path.
    }

    async fn attempt_loop(&mut self, service: Uuid, observer: &dyn ConnectObserver) -> Outcome {
        let secure = self.config.is_secure();
        let mut progress = PairingProgress::default();
        let mut subscription: Option<PairingSubscription> = None;
        loop {
            debug!(
                device = %self.device,
                "connection attempt #{}",
                self.policy.attempts_used() + 1
            );
            if !self.config.can_interrupt_discovery() {
                debug!(device = %self.device, "not permitted to interrupt discovery scan");
                if !self.wait_for_discovery_to_end().await {
                    return Outcome::Cancelled;
                }
            }
            // Best effort; the attempt proceeds whether or not a scan was
            // actually stopped.
            self.platform.discovery.stop_discovery().await;

            let pairing_required = !self.platform.directory.is_bonded(self.device).await;
            if pairing_required && subscription.is_none() {
                debug!(
                    device = %self.device,
                    "pairing will be required as part of connection attempt"
                );
                // Subscribe before the open so a fast pairing transition
                // cannot be missed.
                subscription = Some(self.pairing_monitor.subscribe());
            }

            match self
                .open_transport(service, secure, &mut subscription, &mut progress, observer)
                .await
            {
                Ok(stream) => {
                    if pairing_required && progress.started {
                        match self
                            .resolve_pairing_outcome(&mut subscription, &mut progress)
                            .await
                        {
                            PairingResolution::Cancelled => return Outcome::Cancelled,
                            PairingResolution::Outcome(true) => observer.on_pairing_succeeded(),
                            // The stream is up regardless; the pairing
                            // result is not reported on this path.
                            PairingResolution::Outcome(false) => {}
                        }
                    }
                    return Outcome::Succeeded(Connection::new(self.device, stream));
                }
                Err(OpenError::Cancelled) => return Outcome::Cancelled,
                Err(OpenError::Transport(error)) => {
                    debug!(device = %self.device, "transport open failed: {error:#}");
                    if pairing_required && progress.started {
                        match self
                            .resolve_pairing_outcome(&mut subscription, &mut progress)
                            .await
                        {
                            PairingResolution::Cancelled => return Outcome::Cancelled,
                            PairingResolution::Outcome(true) => {
                                debug!(
                                    device = %self.device,
                                    "pairing succeeded but connection failed - can continue if retries are available"
                                );
                                observer.on_pairing_succeeded();
                            }
                            PairingResolution::Outcome(false) => {
                                debug!(
                                    device = %self.device,
                                    "pairing failed - ignoring any remaining retries"
                                );
                                observer.on_pairing_failed();
                                return Outcome::Failed;
                            }
                        }
                    } else if pairing_required {
                        debug!(
                            device = %self.device,
                            "pairing required but connection failed before it started"
                        );
                    }
                    if self.policy.retry().is_err() {
                        debug!(device = %self.device, "final connection attempt failed");
                        return Outcome::Failed;
                    }
                    let delay = self.policy.current_delay();
                    debug!(
                        device = %self.device,
                        "waiting {:?} before next connection attempt",
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Outcome::Cancelled,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Poll until no discovery scan is running. Returns false if the
    /// attempt was cancelled while waiting.
    async fn wait_for_discovery_to_end(&self) -> bool {
        while self.platform.discovery.is_discovery_running().await {
            debug!(
                device = %self.device,
                "discovery scan in progress - delaying connection attempt by {:?}",
                DISCOVERY_POLL_INTERVAL
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = sleep(DISCOVERY_POLL_INTERVAL) => {}
            }
        }
        true
    }

    /// Open the transport, consuming pairing events concurrently so a
    /// pairing start is reported while the open is still in flight.
    async fn open_transport(
        &self,
        service: Uuid,
        secure: bool,
        subscription: &mut Option<PairingSubscription>,
        progress: &mut PairingProgress,
        observer: &dyn ConnectObserver,
    ) -> Result<Box<dyn TransportStream>, OpenError> {
        enum Step {
            Cancelled,
            Opened(anyhow::Result<Box<dyn TransportStream>>),
            Pairing(Option<PairingEvent>),
        }

        let open = self.platform.transport.open(self.device, service, secure);
        tokio::pin!(open);
        let mut events = subscription.as_mut();
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                event = next_pairing_event(&mut events) => Step::Pairing(event),
                result = &mut open => Step::Opened(result),
            };
            match step {
                Step::Cancelled => return Err(OpenError::Cancelled),
                Step::Opened(result) => return result.map_err(OpenError::Transport),
                Step::Pairing(Some(event)) => {
                    self.record_pairing_event(event, progress, observer)
                }
                Step::Pairing(None) => {
                    warn!(device = %self.device, "pairing monitor reset during connection attempt");
                    events = None;
                }
            }
        }
    }

    fn record_pairing_event(
        &self,
        event: PairingEvent,
        progress: &mut PairingProgress,
        observer: &dyn ConnectObserver,
    ) {
        if event.device != self.device {
            return;
        }
        match event.kind {
            PairingEventKind::Started => {
                if !progress.started {
                    progress.started = true;
                    observer.on_pairing_started();
                }
            }
            PairingEventKind::Succeeded => progress.outcome = Some(true),
            PairingEventKind::Failed => progress.outcome = Some(false),
        }
    }

    /// Block until the pairing outcome for this device is known.
    async fn resolve_pairing_outcome(
        &self,
        subscription: &mut Option<PairingSubscription>,
        progress: &mut PairingProgress,
    ) -> PairingResolution {
        if let Some(outcome) = progress.outcome {
            return PairingResolution::Outcome(outcome);
        }
        debug!(device = %self.device, "waiting for pairing result from system");
        let Some(events) = subscription.as_mut() else {
            warn!(device = %self.device, "no pairing monitor available - treating pairing as failed");
            return PairingResolution::Outcome(false);
        };
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PairingResolution::Cancelled,
                event = events.recv() => match event {
                    Some(event) if event.device == self.device => match event.kind {
                        PairingEventKind::Started => {}
                        PairingEventKind::Succeeded => {
                            progress.outcome = Some(true);
                            return PairingResolution::Outcome(true);
                        }
                        PairingEventKind::Failed => {
                            progress.outcome = Some(false);
                            return PairingResolution::Outcome(false);
                        }
                    },
                    Some(_) => {}
                    None => {
                        // A reset monitor can never deliver the outcome.
                        warn!(
                            device = %self.device,
                            "pairing monitor reset while waiting for pairing result - treating as failed"
                        );
                        progress.outcome = Some(false);
                        return PairingResolution::Outcome(false);
                    }
                }
            }
        }
    }
}

/// The next event from the subscription, pending forever without one so
/// this can sit unconditionally in a `select!` arm.
async fn next_pairing_event(
    subscription: &mut Option<&mut PairingSubscription>,
) -> Option<PairingEvent> {
    match subscription {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::{BondState, BondStateChange};
    use crate::transport::{AdapterStatus, DeviceDirectory, DiscoveryStatus, TransportFactory};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    const DEVICE: DeviceAddress = DeviceAddress::new([0xAA, 0, 0, 0, 0, 1]);

    /// Transport factory that fails a fixed number of times, then hands
    /// out one half of an in-memory duplex. Each open takes `open_delay`.
    struct FlakyFactory {
        failures_left: AtomicUsize,
        opens: AtomicUsize,
        open_delay: Duration,
    }

    impl FlakyFactory {
        fn failing(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                opens: AtomicUsize::new(0),
                open_delay: Duration::ZERO,
            }
        }

        fn failing_slowly(failures: usize, open_delay: Duration) -> Self {
            Self {
                open_delay,
                ..Self::failing(failures)
            }
        }
    }

    #[async_trait]
    impl TransportFactory for FlakyFactory {
        async fn open(
            &self,
            _device: DeviceAddress,
            _service: Uuid,
            _secure: bool,
        ) -> anyhow::Result<Box<dyn TransportStream>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.open_delay).await;
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(anyhow!("transport refused"));
            }
            let (near, _far) = tokio::io::duplex(64);
            Ok(Box::new(near))
        }
    }

    /// Transport factory that never resolves, for cancellation tests.
    struct HangingFactory;

    #[async_trait]
    impl TransportFactory for HangingFactory {
        async fn open(
            &self,
            _device: DeviceAddress,
            _service: Uuid,
            _secure: bool,
        ) -> anyhow::Result<Box<dyn TransportStream>> {
            std::future::pending().await
        }
    }

    struct FakeDiscovery {
        running: AtomicBool,
    }

    #[async_trait]
    impl DiscoveryStatus for FakeDiscovery {
        async fn is_discovery_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn stop_discovery(&self) -> bool {
            self.running.store(false, Ordering::SeqCst);
            true
        }
    }

    struct FakeAdapter;

    #[async_trait]
    impl AdapterStatus for FakeAdapter {
        async fn is_enabled(&self) -> bool {
            true
        }
    }

    struct FakeDirectory {
        bonded: Vec<DeviceAddress>,
    }

    #[async_trait]
    impl DeviceDirectory for FakeDirectory {
        async fn bonded_devices(&self) -> Vec<DeviceAddress> {
            self.bonded.clone()
        }
    }

    fn platform(factory: Arc<dyn TransportFactory>, bonded: Vec<DeviceAddress>) -> Platform {
        Platform {
            transport: factory,
            discovery: Arc::new(FakeDiscovery {
                running: AtomicBool::new(false),
            }),
            adapter: Arc::new(FakeAdapter),
            directory: Arc::new(FakeDirectory { bonded }),
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Reported {
        PairingStarted,
        PairingSucceeded,
        PairingFailed,
        Succeeded,
        Failed,
        Cancelled,
    }

    #[derive(Default)]
    struct RecordingObserver {
        reports: Mutex<Vec<Reported>>,
        connection: Mutex<Option<Connection>>,
    }

    impl RecordingObserver {
        fn reports(&self) -> Vec<Reported> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl ConnectObserver for RecordingObserver {
        fn on_pairing_started(&self) {
            self.reports.lock().unwrap().push(Reported::PairingStarted);
        }

        fn on_pairing_succeeded(&self) {
            self.reports
                .lock()
                .unwrap()
                .push(Reported::PairingSucceeded);
        }

        fn on_pairing_failed(&self) {
            self.reports.lock().unwrap().push(Reported::PairingFailed);
        }

        fn on_connection_succeeded(&self, connection: Connection) {
            *self.connection.lock().unwrap() = Some(connection);
            self.reports.lock().unwrap().push(Reported::Succeeded);
        }

        fn on_connection_failed(&self) {
            self.reports.lock().unwrap().push(Reported::Failed);
        }

        fn on_connection_cancelled(&self) {
            self.reports.lock().unwrap().push(Reported::Cancelled);
        }
    }

    fn config(retries: u32, delay_ms: u64, multiplier: f64) -> ConnectionConfig {
        ConnectionConfig::builder()
            .retry_count(retries)
            .initial_retry_delay(Duration::from_millis(delay_ms))
            .backoff_multiplier(multiplier)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let factory = Arc::new(FlakyFactory::failing(2));
        let platform = platform(factory.clone(), vec![DEVICE]);
        let observer = Arc::new(RecordingObserver::default());
        let task = ConnectTask::new(DEVICE, config(2, 1, 1.0), platform, PairingMonitor::new());

        timeout(Duration::from_secs(5), task.run(observer.clone()))
            .await
            .unwrap();

        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
        assert_eq!(observer.reports(), vec![Reported::Succeeded]);
        assert!(observer.connection.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fails_when_retries_exhausted() {
        let factory = Arc::new(FlakyFactory::failing(usize::MAX));
        let platform = platform(factory.clone(), vec![DEVICE]);
        let observer = Arc::new(RecordingObserver::default());
        let task = ConnectTask::new(DEVICE, config(1, 1, 1.0), platform, PairingMonitor::new());

        timeout(Duration::from_secs(5), task.run(observer.clone()))
            .await
            .unwrap();

        // Initial attempt plus one retry.
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert_eq!(observer.reports(), vec![Reported::Failed]);
    }

    #[tokio::test]
    async fn test_cancel_during_open_reports_cancelled() {
        let platform = platform(Arc::new(HangingFactory), vec![DEVICE]);
        let observer = Arc::new(RecordingObserver::default());
        let task = ConnectTask::new(
            DEVICE,
            ConnectionConfig::default(),
            platform,
            PairingMonitor::new(),
        );
        let cancel = task.cancel_token();

        let running = tokio::spawn(task.run(observer.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        timeout(Duration::from_secs(5), running).await.unwrap().unwrap();

        assert_eq!(observer.reports(), vec![Reported::Cancelled]);
    }

    #[tokio::test]
    async fn test_pairing_failure_is_fatal_despite_retry_budget() {
        use BondState::*;
        // Opens are slow enough that the scripted pairing failure lands
        // while the first one is still in flight.
        let factory = Arc::new(FlakyFactory::failing_slowly(
            usize::MAX,
            Duration::from_millis(100),
        ));
        let platform = platform(factory.clone(), Vec::new());
        let monitor = PairingMonitor::new();
        let observer = Arc::new(RecordingObserver::default());
        let task = ConnectTask::new(DEVICE, config(2, 1, 1.0), platform, monitor.clone());

        let running = tokio::spawn(task.run(observer.clone()));
        // Let the task subscribe and start its first open, then script the
        // pairing failure.
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.start(futures::stream::iter(vec![
            BondStateChange {
                device: DEVICE,
                previous: NotBonded,
                current: Bonding,
            },
            BondStateChange {
                device: DEVICE,
                previous: Bonding,
                current: NotBonded,
            },
        ]));
        timeout(Duration::from_secs(5), running).await.unwrap().unwrap();

        assert_eq!(
            observer.reports(),
            vec![
                Reported::PairingStarted,
                Reported::PairingFailed,
                Reported::Failed
            ]
        );
        // The remaining retry budget was abandoned.
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pairing_success_reported_on_successful_connect() {
        use BondState::*;
        let factory = Arc::new(FlakyFactory::failing_slowly(0, Duration::from_millis(100)));
        let platform = platform(factory, Vec::new());
        let monitor = PairingMonitor::new();
        let observer = Arc::new(RecordingObserver::default());
        let task = ConnectTask::new(
            DEVICE,
            ConnectionConfig::default(),
            platform,
            monitor.clone(),
        );

        let running = tokio::spawn(task.run(observer.clone()));
        // The task is subscribed once its open is in flight; script the
        // pairing flow while it waits.
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.start(futures::stream::iter(vec![
            BondStateChange {
                device: DEVICE,
                previous: NotBonded,
                current: Bonding,
            },
            BondStateChange {
                device: DEVICE,
                previous: Bonding,
                current: Bonded,
            },
        ]));
        timeout(Duration::from_secs(5), running).await.unwrap().unwrap();

        assert_eq!(
            observer.reports(),
            vec![
                Reported::PairingStarted,
                Reported::PairingSucceeded,
                Reported::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_events_for_other_devices_are_ignored() {
        use BondState::*;
        let other = DeviceAddress::new([0xBB, 0, 0, 0, 0, 2]);
        let factory = Arc::new(FlakyFactory::failing(0));
        let platform = platform(factory, Vec::new());
        let monitor = PairingMonitor::new();
        monitor.start(futures::stream::iter(vec![BondStateChange {
            device: other,
            previous: NotBonded,
            current: Bonding,
        }]));
        let observer = Arc::new(RecordingObserver::default());
        let task = ConnectTask::new(
            DEVICE,
            ConnectionConfig::default(),
            platform,
            monitor.clone(),
        );

        timeout(Duration::from_secs(5), task.run(observer.clone()))
            .await
            .unwrap();

        assert_eq!(observer.reports(), vec![Reported::Succeeded]);
    }
}
