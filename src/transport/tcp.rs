//! TCP-backed transport factory for development and tests.
//!
//! Maps device addresses to socket addresses so the whole engine can be
//! exercised over loopback without radio hardware.

use crate::device::DeviceAddress;
use crate::transport::traits::{TransportFactory, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

/// Transport factory that connects over TCP to a per-device socket address.
#[derive(Default)]
pub struct TcpTransportFactory {
    routes: Mutex<HashMap<DeviceAddress, SocketAddr>>,
}

impl TcpTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a device address to the socket address its stream lives at.
    pub fn route(&self, device: DeviceAddress, addr: SocketAddr) {
        self.routes.lock().unwrap().insert(device, addr);
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn open(
        &self,
        device: DeviceAddress,
        service: Uuid,
        secure: bool,
    ) -> Result<Box<dyn TransportStream>> {
        let addr = self
            .routes
            .lock()
            .unwrap()
            .get(&device)
            .copied()
            .ok_or_else(|| anyhow!("no route for device {device}"))?;
        debug!(device = %device, %addr, %service, secure, "opening TCP transport");
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}
