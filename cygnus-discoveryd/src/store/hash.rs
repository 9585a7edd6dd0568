use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{DeviceRecord, DeviceStatus, ServiceMap};

/// Only fields a dashboard renders differently; timestamps move on every
/// reconciliation and are left out.
#[derive(Serialize)]
struct HashView<'a> {
    identity_key: &'a str,
    name: &'a str,
    hostname: &'a str,
    ip: Option<&'a str>,
    port: u16,
    model: &'a str,
    firmware_version: &'a str,
    device_id: &'a str,
    memory_usage: &'a str,
    services: &'a ServiceMap,
    display_name: Option<&'a str>,
    status: DeviceStatus,
}

/// Computes a SHA-256 fingerprint of the device list.
/// Devices are sorted by identity key for deterministic output.
pub fn compute_hash(devices: &[DeviceRecord]) -> String {
    let mut indices: Vec<usize> = (0..devices.len()).collect();
    indices.sort_by(|&a, &b| devices[a].identity_key.cmp(&devices[b].identity_key));

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let d = &devices[i];
            HashView {
                identity_key: &d.identity_key,
                name: &d.name,
                hostname: &d.hostname,
                ip: d.ip.as_deref(),
                port: d.port,
                model: &d.model,
                firmware_version: &d.firmware_version,
                device_id: &d.device_id,
                memory_usage: &d.memory_usage,
                services: &d.services,
                display_name: d.display_name.as_deref(),
                status: d.status,
            }
        })
        .collect();

    // Serializing plain strings, integers and a string-keyed map cannot fail
    let json = serde_json::to_vec(&views).unwrap_or_default();

    hex::encode(Sha256::digest(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_record(identity_key: &str) -> DeviceRecord {
        DeviceRecord {
            identity_key: identity_key.to_string(),
            name: format!("{}._cygnus._tcp.local.", identity_key),
            hostname: "sensor.local.".to_string(),
            ip: Some("192.168.1.40".to_string()),
            port: 80,
            model: "CX-200".to_string(),
            firmware_version: "2.4.1".to_string(),
            device_id: "N/A".to_string(),
            memory_usage: "N/A".to_string(),
            services: ServiceMap::new(),
            display_name: None,
            status: DeviceStatus::Online,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_hash_deterministic() {
        let a = test_record("1");
        let b = test_record("2");

        let hash1 = compute_hash(&[a.clone(), b.clone()]);
        let hash2 = compute_hash(&[b, a]);

        assert_eq!(hash1, hash2, "Hash should be same regardless of input order");
    }

    #[test]
    fn test_hash_changes_on_status_and_rename() {
        let online = test_record("1");
        let base = compute_hash(&[online.clone()]);

        let mut offline = online.clone();
        offline.status = DeviceStatus::Offline;
        assert_ne!(base, compute_hash(&[offline]));

        let mut renamed = online;
        renamed.display_name = Some("Lobby Sensor".to_string());
        assert_ne!(base, compute_hash(&[renamed]));
    }

    #[test]
    fn test_hash_stable_across_timestamp_changes() {
        let a = test_record("1");
        let mut b = a.clone();
        b.last_seen = a.last_seen + chrono::Duration::seconds(60);
        b.first_seen = a.first_seen - chrono::Duration::seconds(60);

        assert_eq!(compute_hash(&[a]), compute_hash(&[b]));
    }
}
