pub mod browser;
pub mod cache;
pub mod txt;

use std::net::IpAddr;
use std::time::Duration;
use async_trait::async_trait;

/// A raw TXT entry as it came off the wire. The value is absent for bare keys.
pub type TxtPair = (Vec<u8>, Option<Vec<u8>>);

/// A resolved service instance, before parsing into a device descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAdvertisement {
    /// Full instance name, e.g. "sensor-01._cygnus._tcp.local."
    pub name: String,
    pub hostname: String,
    pub port: u16,
    /// IPv4 addresses first, then IPv6
    pub addresses: Vec<IpAddr>,
    pub txt: Vec<TxtPair>,
}

/// Browse notifications for the watched service type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Discovered { service_type: String, name: String },
    Updated { service_type: String, name: String },
    Removed { service_type: String, name: String },
}

/// The part of the mDNS substrate the engine depends on.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Full service info for `name`, or `None` if it is not available within `timeout`.
    async fn resolve(
        &self,
        service_type: &str,
        name: &str,
        timeout: Duration,
    ) -> Option<ServiceAdvertisement>;

    /// Ask responders to announce themselves again.
    fn requery(&self) {}

    /// Whether browsing has begun.
    fn is_started(&self) -> bool;
}
