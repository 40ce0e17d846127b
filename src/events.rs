//! Events delivered to the application.
//!
//! Every externally visible callback of the library is a variant on one of
//! these enums, sent down an unbounded channel whose receiver the
//! application drains on its own scheduling context. Dropping a receiver
//! detaches interest; the library silently drops events it can no longer
//! deliver.

use crate::connection::Connection;
use crate::device::DeviceAddress;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Sender half of a per-attempt event channel, supplied to
/// [`crate::connection::ConnectionManager::connect`].
pub type AttemptSink = mpsc::UnboundedSender<ConnectionAttemptEvent>;

/// Progress and result of a single connection attempt.
///
/// Delivery order per attempt: at most one `PairingStarted`, then
/// optionally one of `PairingSucceeded`/`PairingFailed`, then exactly one
/// terminal variant (`Succeeded`, `Failed` or `Cancelled`).
#[derive(Debug, Clone)]
pub enum ConnectionAttemptEvent {
    /// Pairing with the peer has started as part of the attempt.
    PairingStarted { device: DeviceAddress },
    /// Pairing completed successfully. Informational; the attempt itself
    /// may still fail.
    PairingSucceeded { device: DeviceAddress },
    /// Pairing failed. The attempt will fail without further retries.
    PairingFailed { device: DeviceAddress },
    /// The attempt succeeded and the connection is open.
    Succeeded {
        device: DeviceAddress,
        connection: Connection,
    },
    /// The attempt failed and all retries are exhausted.
    Failed { device: DeviceAddress },
    /// The attempt was cancelled before completing.
    Cancelled { device: DeviceAddress },
}

/// Device-level connectivity changes, fanned out to every subscriber of
/// [`crate::connection::ConnectionManager::subscribe_device_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device is now connected.
    Connected { device: DeviceAddress },
    /// A previously connected device has been disconnected.
    Disconnected {
        device: DeviceAddress,
        /// Whether the disconnection was caused by an error rather than a
        /// deliberate close.
        by_error: bool,
    },
}

/// Adapter power transitions, relayed by
/// [`crate::status::AdapterStatusMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatusEvent {
    Enabled,
    Disabled,
}

/// Results of asynchronous operations on a
/// [`crate::connection::ConnectionClient`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Data arrived from the peer.
    DataRead(Bytes),
    /// A queued write completed.
    DataWritten(Bytes),
    /// Reading failed; the connection has been closed by error.
    ReadError,
    /// A queued write failed; the connection has been closed by error.
    WriteError(Bytes),
    /// The underlying connection is closed. A pump that was blocked on the
    /// failing stream may still report its error after this.
    Closed { by_error: bool },
}
