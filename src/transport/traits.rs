//! Capability traits for the platform layer backing the connection engine.
//!
//! The engine never talks to a radio stack directly. Everything it needs
//! from the platform - opening raw streams, discovery status, adapter
//! status, the bonded-device directory - comes in through these traits,
//! bundled into a [`Platform`] that is built once at startup and passed by
//! value to every consumer.

use crate::device::DeviceAddress;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Service identifier used when neither the configuration nor the device
/// directory suggests one: 00001101-0000-1000-8000-00805F9B34FB, the
/// common serial-stream service.
pub const FALLBACK_SERVICE_ID: Uuid =
    Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// A raw bidirectional byte stream to one peer.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Factory producing connected transport streams.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a stream to `service` on `device`, resolving once the platform
    /// reports success or failure. The open may take arbitrarily long;
    /// dropping the returned future closes any half-open handle, which is
    /// how the engine cancels an in-flight open.
    async fn open(
        &self,
        device: DeviceAddress,
        service: Uuid,
        secure: bool,
    ) -> Result<Box<dyn TransportStream>>;
}

/// Status of the platform's device discovery scanning.
#[async_trait]
pub trait DiscoveryStatus: Send + Sync {
    /// Whether a discovery scan is currently running.
    async fn is_discovery_running(&self) -> bool;

    /// Ask for any running scan to be stopped. Best effort; returns
    /// whether the request was accepted.
    async fn stop_discovery(&self) -> bool;
}

/// Status of the local adapter.
#[async_trait]
pub trait AdapterStatus: Send + Sync {
    /// Whether the adapter is powered and usable.
    async fn is_enabled(&self) -> bool;
}

/// Directory of devices already bonded with the local adapter.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Devices currently bonded.
    async fn bonded_devices(&self) -> Vec<DeviceAddress>;

    /// Whether one device is bonded.
    async fn is_bonded(&self, device: DeviceAddress) -> bool {
        self.bonded_devices().await.contains(&device)
    }

    /// The service the device is known to offer, if the platform has one
    /// on record.
    async fn suggested_service(&self, device: DeviceAddress) -> Option<Uuid> {
        let _ = device;
        None
    }
}

/// The platform capabilities consumed by the engine, constructed once at
/// process startup and shared by value.
#[derive(Clone)]
pub struct Platform {
    pub transport: Arc<dyn TransportFactory>,
    pub discovery: Arc<dyn DiscoveryStatus>,
    pub adapter: Arc<dyn AdapterStatus>,
    pub directory: Arc<dyn DeviceDirectory>,
}
