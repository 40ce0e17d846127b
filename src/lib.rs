//! Device-connection management over pluggable stream transports.
//!
//! `tether` sits on top of a platform radio stack (consumed through the
//! capability traits in [`transport`]) and drives the lifecycle of stream
//! connections to remote peers: at most one attempt or open connection per
//! device, pairing handled as a side effect of connecting, retry with
//! exponential backoff, cooperative cancellation, and multiplexed
//! read/write access to each open connection.
//!
//! Blocking work runs on the tokio worker pool; everything the
//! application sees arrives as tagged events on unbounded channels it
//! drains on its own scheduling context.
//!
//! ```no_run
//! use tether::{ConnectionConfig, DeviceAddress, Platform, Tether};
//! # async fn example(platform: Platform) {
//! let service = Tether::new(platform);
//! service.start(futures::stream::pending(), futures::stream::pending());
//!
//! let device: DeviceAddress = "00:11:22:33:44:55".parse().unwrap();
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
//! if service.connect(device, ConnectionConfig::default(), Some(events_tx)) {
//!     while let Some(event) = events_rx.recv().await {
//!         println!("{event:?}");
//!     }
//! }
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod device;
pub mod events;
pub mod pairing;
pub mod retry;
pub mod status;
pub mod sync;
pub mod transport;

mod service;

pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::{Connection, ConnectionClient, ConnectionError, ConnectionManager};
pub use device::DeviceAddress;
pub use events::{
    AdapterStatusEvent, AttemptSink, ClientEvent, ConnectionAttemptEvent, DeviceEvent,
};
pub use pairing::{BondState, BondStateChange, PairingMonitor};
pub use retry::{RetryError, RetryPolicy};
pub use service::Tether;
pub use status::AdapterStatusMonitor;
pub use transport::{Platform, TransportFactory, TransportStream, FALLBACK_SERVICE_ID};
