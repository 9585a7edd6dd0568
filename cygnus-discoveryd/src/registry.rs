use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use chrono::{DateTime, Duration, Utc};
use shared::types::DeviceDescriptor;

/// Result of writing a freshly resolved descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Created,
    Replaced,
}

/// Result of applying a probe answer to an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeApplied {
    /// Only `last_seen` moved
    Refreshed,
    /// The advertisement itself changed and was replaced
    Changed,
    /// The entry was removed while the probe was in flight
    Gone,
}

/// In-memory view of currently reachable devices, keyed by advertised name.
///
/// Cloning gives another handle to the same map. Every method holds the lock
/// only for the map operation itself.
#[derive(Clone, Default)]
pub struct LiveRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceDescriptor>>>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of all entries, ordered by name.
    pub fn snapshot(&self) -> Vec<DeviceDescriptor> {
        let mut devices: Vec<DeviceDescriptor> = self.read().values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<DeviceDescriptor> {
        self.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Create or replace the entry for `desc.name`. `last_seen` never moves backwards.
    pub fn upsert(&self, mut desc: DeviceDescriptor) -> Upserted {
        let mut devices = self.write();
        match devices.get(&desc.name).map(|existing| existing.last_seen) {
            Some(previous) => {
                desc.last_seen = desc.last_seen.max(previous);
                devices.insert(desc.name.clone(), desc);
                Upserted::Replaced
            }
            None => {
                devices.insert(desc.name.clone(), desc);
                Upserted::Created
            }
        }
    }

    /// Refresh an entry that is still present. Never creates one.
    pub fn apply_probe(&self, desc: DeviceDescriptor) -> ProbeApplied {
        let mut devices = self.write();
        let Some(existing) = devices.get_mut(&desc.name) else {
            return ProbeApplied::Gone;
        };

        let last_seen = desc.last_seen.max(existing.last_seen);
        if existing.same_advertisement(&desc) {
            existing.last_seen = last_seen;
            ProbeApplied::Refreshed
        } else {
            *existing = DeviceDescriptor { last_seen, ..desc };
            ProbeApplied::Changed
        }
    }

    pub fn remove(&self, name: &str) -> Option<DeviceDescriptor> {
        self.write().remove(name)
    }

    /// Drop every entry whose last confirmation is older than `timeout` at `now`.
    /// Returns the evicted names.
    pub fn evict_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let cutoff = now - timeout;
        let mut devices = self.write();
        let stale: Vec<String> = devices
            .iter()
            .filter(|(_, desc)| desc.last_seen < cutoff)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &stale {
            devices.remove(name);
        }
        stale
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceDescriptor>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceDescriptor>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }
}
