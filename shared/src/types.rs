use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A protocol endpoint a device declares in its TXT records, e.g. `modbus:502=enabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCapability {
    /// `None` when the advertised port was not a valid number
    pub port: Option<u16>,
    pub enabled: bool,
}

/// Capability name -> endpoint. Ordered so serialized output is stable.
pub type ServiceMap = BTreeMap<String, ServiceCapability>;

/// The live view of one advertised device instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Full mDNS instance name, e.g. "sensor-01._cygnus._tcp.local."
    pub name: String,

    pub hostname: String,

    /// TXT-declared IP when present, otherwise the first resolved address
    pub ip: Option<String>,

    pub port: u16,

    /// Stable hardware identifier (IMEI). Devices without one are never persisted.
    pub identity_key: Option<String>,

    pub model: String,
    pub firmware_version: String,
    pub device_id: String,
    pub memory_usage: String,

    pub services: ServiceMap,

    /// Most recent confirmation from a discovery event or probe
    pub last_seen: DateTime<Utc>,
}

impl DeviceDescriptor {
    /// True when both descriptors carry the same advertised data, ignoring `last_seen`.
    pub fn same_advertisement(&self, other: &DeviceDescriptor) -> bool {
        self.name == other.name
            && self.hostname == other.hostname
            && self.ip == other.ip
            && self.port == other.port
            && self.identity_key == other.identity_key
            && self.model == other.model
            && self.firmware_version == other.firmware_version
            && self.device_id == other.device_id
            && self.memory_usage == other.memory_usage
            && self.services == other.services
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(DeviceStatus::Online),
            "offline" => Some(DeviceStatus::Offline),
            _ => None,
        }
    }
}

/// A device as remembered by the persistent store, keyed by `identity_key`.
/// This is the canonical record served to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub identity_key: String,

    /// Last advertised instance name; may change across reboots
    pub name: String,

    pub hostname: String,
    pub ip: Option<String>,
    pub port: u16,
    pub model: String,
    pub firmware_version: String,
    pub device_id: String,
    pub memory_usage: String,
    pub services: ServiceMap,

    /// User-assigned label; discovery never writes this
    pub display_name: Option<String>,

    pub status: DeviceStatus,

    /// Set once, on first reconciliation
    pub first_seen: DateTime<Utc>,

    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            name: "sensor._cygnus._tcp.local.".to_string(),
            hostname: "sensor.local.".to_string(),
            ip: Some("192.168.1.20".to_string()),
            port: 80,
            identity_key: Some("111222333".to_string()),
            model: "CX-1".to_string(),
            firmware_version: "1.0.0".to_string(),
            device_id: "dev-1".to_string(),
            memory_usage: "42%".to_string(),
            services: ServiceMap::new(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_same_advertisement_ignores_last_seen() {
        let a = descriptor();
        let mut b = a.clone();
        b.last_seen = a.last_seen + chrono::Duration::seconds(30);
        assert!(a.same_advertisement(&b));

        b.firmware_version = "1.0.1".to_string();
        assert!(!a.same_advertisement(&b));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DeviceStatus::Offline).unwrap();
        assert_eq!(json, "\"offline\"");
        assert_eq!(DeviceStatus::parse("online"), Some(DeviceStatus::Online));
        assert_eq!(DeviceStatus::parse("gone"), None);
    }
}
