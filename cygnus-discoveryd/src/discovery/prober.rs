use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use crate::mdns::txt::parse_advertisement;
use crate::mdns::ServiceResolver;
use crate::registry::{LiveRegistry, ProbeApplied};

/// Counts from one probe pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub probed: usize,
    pub refreshed: usize,
    pub changed: usize,
    pub missed: usize,
}

/// Re-resolves every known device on a fixed period to keep `last_seen`
/// current. It never adds devices; new ones come from the listener.
#[derive(Clone)]
pub struct Prober {
    registry: LiveRegistry,
    resolver: Arc<dyn ServiceResolver>,
    service_type: String,
    timeout: Duration,
}

impl Prober {
    pub fn new(
        registry: LiveRegistry,
        resolver: Arc<dyn ServiceResolver>,
        service_type: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            resolver,
            service_type: service_type.into(),
            timeout,
        }
    }

    pub fn is_available(&self) -> bool {
        self.resolver.is_started()
    }

    /// One best-effort pass over the current registry contents.
    pub async fn probe_once(&self) -> ProbeReport {
        if self.registry.is_empty() {
            return ProbeReport::default();
        }
        self.resolver.requery();

        let names = self.registry.names();
        let answers = join_all(names.iter().map(|name| {
            self.resolver.resolve(&self.service_type, name, self.timeout)
        }))
        .await;

        let mut report = ProbeReport { probed: names.len(), ..ProbeReport::default() };
        for (name, answer) in names.iter().zip(answers) {
            let Some(adv) = answer else {
                tracing::debug!("Probe got no answer from {}", name);
                report.missed += 1;
                continue;
            };
            match self.registry.apply_probe(parse_advertisement(&adv, Utc::now())) {
                ProbeApplied::Refreshed => report.refreshed += 1,
                ProbeApplied::Changed => {
                    tracing::debug!("Probe saw changed advertisement for {}", name);
                    report.changed += 1;
                }
                ProbeApplied::Gone => report.missed += 1,
            }
        }

        report
    }

    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; the registry is empty at startup anyway
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.probe_once().await;
                    tracing::debug!(
                        "Probe pass: {} probed, {} refreshed, {} changed, {} missed",
                        report.probed,
                        report.refreshed,
                        report.changed,
                        report.missed
                    );
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Prober shutting down");
                    break;
                }
            }
        }
    }
}
