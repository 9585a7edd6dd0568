use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use crate::config::ReaperConfig;
use crate::registry::LiveRegistry;

/// Evicts registry entries that have not been confirmed within the liveness timeout.
#[derive(Clone)]
pub struct Reaper {
    registry: LiveRegistry,
    timeout: chrono::Duration,
}

impl Reaper {
    pub fn new(registry: LiveRegistry, config: &ReaperConfig) -> Self {
        Self {
            registry,
            timeout: crate::config::window(config.timeout_secs),
        }
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let evicted = self.registry.evict_stale(now, self.timeout);
        for name in &evicted {
            tracing::info!("Evicted stale device {}", name);
        }
        evicted
    }

    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_at(Utc::now());
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Reaper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::descriptor;

    #[test]
    fn test_sweep_evicts_once() {
        let registry = LiveRegistry::new();
        let now = Utc::now();
        registry.upsert(descriptor("stale", Some("1"), now - chrono::Duration::seconds(121)));
        registry.upsert(descriptor("edge", Some("2"), now - chrono::Duration::seconds(120)));

        let reaper = Reaper::new(registry.clone(), &ReaperConfig::default());

        assert_eq!(reaper.sweep_at(now), vec!["stale._cygnus._tcp.local.".to_string()]);
        assert!(reaper.sweep_at(now).is_empty());
        assert_eq!(registry.len(), 1);
    }
}
