//! Scripted stand-in for the mDNS substrate.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use crate::mdns::{ServiceAdvertisement, ServiceResolver};

pub const SERVICE_TYPE: &str = shared::protocol::CYGNUS_SERVICE_TYPE;

pub fn advertisement(instance: &str, imei: Option<&str>) -> ServiceAdvertisement {
    let mut txt = vec![(b"modbus:502".to_vec(), Some(b"enabled".to_vec()))];
    if let Some(imei) = imei {
        txt.push((b"imei".to_vec(), Some(imei.as_bytes().to_vec())));
    }
    ServiceAdvertisement {
        name: format!("{}.{}", instance, SERVICE_TYPE),
        hostname: format!("{}.local.", instance),
        port: 80,
        addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))],
        txt,
    }
}

pub struct FakeResolver {
    published: Mutex<HashMap<String, ServiceAdvertisement>>,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<HashMap<String, u32>>,
    requeries: AtomicUsize,
    started: AtomicBool,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            requeries: AtomicUsize::new(0),
            started: AtomicBool::new(true),
        }
    }

    pub fn publish(&self, adv: ServiceAdvertisement) {
        self.published.lock().unwrap().insert(adv.name.clone(), adv);
    }

    pub fn withdraw(&self, name: &str) {
        self.published.lock().unwrap().remove(name);
    }

    /// Make the next `count` resolves of `name` fail
    pub fn fail_next(&self, name: &str, count: u32) {
        self.failures.lock().unwrap().insert(name.to_string(), count);
    }

    pub fn calls(&self, name: &str) -> u32 {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn requeries(&self) -> usize {
        self.requeries.load(Ordering::SeqCst)
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceResolver for FakeResolver {
    async fn resolve(
        &self,
        _service_type: &str,
        name: &str,
        timeout: Duration,
    ) -> Option<ServiceAdvertisement> {
        *self.calls.lock().unwrap().entry(name.to_string()).or_default() += 1;

        let failing = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(name) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };

        let found = if failing {
            None
        } else {
            self.published.lock().unwrap().get(name).cloned()
        };
        if found.is_none() {
            tokio::time::sleep(timeout).await;
        }
        found
    }

    fn requery(&self) {
        self.requeries.fetch_add(1, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
