//! TXT record parsing.
//!
//! Reserved keys map straight onto descriptor fields. Any other key of the
//! form `<service>:<port>` declares a service capability whose value is the
//! enabled flag, e.g. `modbus:502=enabled`.

use chrono::{DateTime, Utc};
use shared::protocol::{
    TXT_DEVICE_ID, TXT_FIRMWARE, TXT_IMEI, TXT_IP, TXT_MEMORY_USAGE, TXT_MODEL, UNKNOWN,
};
use shared::types::{DeviceDescriptor, ServiceCapability, ServiceMap};
use super::{ServiceAdvertisement, TxtPair};

/// Decoded TXT metadata of one advertisement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TxtRecord {
    pub ip: Option<String>,
    pub imei: Option<String>,
    pub device_id: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub memory_usage: Option<String>,
    pub services: ServiceMap,
}

/// Decode raw TXT pairs. Pairs that are not valid UTF-8, or carry no value,
/// are skipped. Later duplicates overwrite earlier ones.
pub fn parse_txt(pairs: &[TxtPair]) -> TxtRecord {
    let mut record = TxtRecord::default();

    for (raw_key, raw_value) in pairs {
        let Some(raw_value) = raw_value else {
            continue;
        };
        let (Ok(key), Ok(value)) = (std::str::from_utf8(raw_key), std::str::from_utf8(raw_value))
        else {
            continue;
        };

        let value = value.trim();
        let field = match key {
            TXT_IP => &mut record.ip,
            TXT_IMEI => &mut record.imei,
            TXT_DEVICE_ID => &mut record.device_id,
            TXT_MODEL => &mut record.model,
            TXT_FIRMWARE => &mut record.firmware_version,
            TXT_MEMORY_USAGE => &mut record.memory_usage,
            other => {
                if let Some((service, capability)) = parse_capability(other, value) {
                    record.services.insert(service, capability);
                }
                continue;
            }
        };
        *field = non_empty(value);
    }

    record
}

/// Build a descriptor from a resolved advertisement, stamped with `seen_at`.
pub fn parse_advertisement(adv: &ServiceAdvertisement, seen_at: DateTime<Utc>) -> DeviceDescriptor {
    let txt = parse_txt(&adv.txt);

    let hostname = if adv.hostname.is_empty() {
        adv.name.clone()
    } else {
        adv.hostname.clone()
    };

    let ip = txt
        .ip
        .or_else(|| adv.addresses.first().map(|addr| addr.to_string()));

    DeviceDescriptor {
        name: adv.name.clone(),
        hostname,
        ip,
        port: adv.port,
        identity_key: txt.imei.filter(|imei| imei != UNKNOWN),
        model: txt.model.unwrap_or_else(unknown),
        firmware_version: txt.firmware_version.unwrap_or_else(unknown),
        device_id: txt.device_id.unwrap_or_else(unknown),
        memory_usage: txt.memory_usage.unwrap_or_else(unknown),
        services: txt.services,
        last_seen: seen_at,
    }
}

fn parse_capability(key: &str, flag: &str) -> Option<(String, ServiceCapability)> {
    let (service, port) = key.rsplit_once(':')?;
    let service = service.trim();
    if service.is_empty() {
        return None;
    }

    Some((
        service.to_string(),
        ServiceCapability {
            port: port.trim().parse::<u16>().ok(),
            enabled: is_enabled(flag),
        },
    ))
}

fn is_enabled(flag: &str) -> bool {
    matches!(
        flag.to_ascii_lowercase().as_str(),
        "enabled" | "enable" | "true" | "on" | "yes" | "1"
    )
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn unknown() -> String {
    UNKNOWN.to_string()
}
