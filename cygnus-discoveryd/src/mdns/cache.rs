//! Resolved-advertisement cache behind the mdns-sd adapter.
//!
//! An entry answers `resolve` only while it is fresh: resolved since the
//! last requery, or still inside its host record TTL. Anything older has to
//! be confirmed by a new `ServiceResolved` before it counts again.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use mdns_sd::{ServiceEvent, ServiceInfo};
use super::{DiscoveryEvent, ServiceAdvertisement, TxtPair};

struct CachedAdvertisement {
    adv: ServiceAdvertisement,
    resolved_at: Instant,
    ttl: Duration,
}

impl CachedAdvertisement {
    fn is_fresh(&self, now: Instant, last_requery: Option<Instant>) -> bool {
        let since_requery = last_requery.map_or(true, |at| self.resolved_at >= at);
        let within_ttl = now < self.resolved_at + self.ttl;
        since_requery || within_ttl
    }
}

pub struct ResolvedCache {
    entries: Mutex<HashMap<String, CachedAdvertisement>>,
    last_requery: Mutex<Option<Instant>>,
    /// Bumped on every insert to wake pending resolves
    generation: watch::Sender<u64>,
}

impl Default for ResolvedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvedCache {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            last_requery: Mutex::new(None),
            generation,
        }
    }

    /// Entries resolved before this instant must be re-resolved, unless
    /// their TTL still covers them.
    pub fn mark_requery(&self) {
        *self.last_requery.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Update the cache from a daemon event and map it to a discovery event.
    pub fn handle_event(&self, event: ServiceEvent) -> Option<DiscoveryEvent> {
        match event {
            ServiceEvent::ServiceFound(service_type, name) => {
                tracing::debug!("Service found: {}", name);
                Some(DiscoveryEvent::Discovered { service_type, name })
            }
            ServiceEvent::ServiceResolved(info) => {
                let adv = convert_service_info(&info);
                let name = adv.name.clone();
                let entry = CachedAdvertisement {
                    adv,
                    resolved_at: Instant::now(),
                    ttl: Duration::from_secs(u64::from(info.get_host_ttl())),
                };
                let previous = self.entries().insert(name.clone(), entry);
                self.generation.send_modify(|g| *g = g.wrapping_add(1));

                let service_type = info.get_type().to_string();
                tracing::debug!("Service resolved: {}", name);
                // A first resolution that arrives after the listener gave up
                // on the matching ServiceFound still has to be picked up.
                Some(match previous {
                    Some(_) => DiscoveryEvent::Updated { service_type, name },
                    None => DiscoveryEvent::Discovered { service_type, name },
                })
            }
            ServiceEvent::ServiceRemoved(service_type, name) => {
                tracing::debug!("Service removed: {}", name);
                self.entries().remove(&name);
                Some(DiscoveryEvent::Removed { service_type, name })
            }
            _ => None,
        }
    }

    /// A fresh advertisement for `name`, waiting up to `timeout` for one.
    pub async fn resolve(&self, name: &str, timeout: Duration) -> Option<ServiceAdvertisement> {
        let deadline = Instant::now() + timeout;
        // Subscribe before looking so an insert in between still wakes us
        let mut generation = self.generation.subscribe();

        loop {
            let fresh = self.fresh(name);
            if fresh.is_some() {
                return fresh;
            }
            match tokio::time::timeout_at(deadline, generation.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    fn fresh(&self, name: &str) -> Option<ServiceAdvertisement> {
        let last_requery = *self.last_requery.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        self.entries()
            .get(name)
            .filter(|entry| entry.is_fresh(now, last_requery))
            .map(|entry| entry.adv.clone())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedAdvertisement>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Convert an mdns-sd ServiceInfo to our ServiceAdvertisement
fn convert_service_info(info: &ServiceInfo) -> ServiceAdvertisement {
    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort_by_key(|addr| (addr.is_ipv6(), *addr));

    let txt: Vec<TxtPair> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().as_bytes().to_vec(), prop.val().map(|v| v.to_vec())))
        .collect();

    ServiceAdvertisement {
        name: info.get_fullname().to_string(),
        hostname: info.get_hostname().to_string(),
        port: info.get_port(),
        addresses,
        txt,
    }
}
