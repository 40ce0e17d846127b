pub mod tcp;
pub mod traits;

pub use tcp::TcpTransportFactory;
pub use traits::{
    AdapterStatus, DeviceDirectory, DiscoveryStatus, Platform, TransportFactory, TransportStream,
    FALLBACK_SERVICE_ID,
};
