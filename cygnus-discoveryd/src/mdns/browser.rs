use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use anyhow::{Context, Result};
use super::cache::ResolvedCache;
use super::{DiscoveryEvent, ServiceAdvertisement, ServiceResolver};

enum BrowseStep {
    Event(std::result::Result<ServiceEvent, flume::RecvError>),
    Requery,
    Shutdown,
}

/// mdns-sd backed discovery substrate for a single service type.
///
/// Resolutions land in a [`ResolvedCache`] so `resolve` can be answered from
/// memory. After a requery only answers newer than the query, or records
/// still inside their TTL, count as present.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    service_type: String,
    cache: ResolvedCache,
    requery: Notify,
    started: AtomicBool,
}

impl MdnsBrowser {
    pub fn new(daemon: ServiceDaemon, service_type: impl Into<String>) -> Self {
        Self {
            daemon,
            service_type: service_type.into(),
            cache: ResolvedCache::new(),
            requery: Notify::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Browse the service type and forward browse notifications until cancelled.
    pub async fn run(
        &self,
        tx: mpsc::Sender<DiscoveryEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        tracing::info!("Browsing for {}", self.service_type);

        let mut receiver = self
            .daemon
            .browse(&self.service_type)
            .with_context(|| format!("Failed to browse {}", self.service_type))?;
        self.started.store(true, Ordering::SeqCst);

        loop {
            let step = tokio::select! {
                event = receiver.recv_async() => BrowseStep::Event(event),
                _ = self.requery.notified() => BrowseStep::Requery,
                _ = cancel.cancelled() => BrowseStep::Shutdown,
            };

            match step {
                BrowseStep::Event(Ok(event)) => {
                    if let Some(event) = self.cache.handle_event(event) {
                        if let Err(e) = tx.send(event).await {
                            tracing::error!("Failed to forward discovery event: {}", e);
                        }
                    }
                }
                BrowseStep::Event(Err(e)) => {
                    tracing::warn!("Browse channel closed: {}, restarting browse", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if let Some(fresh) = self.restart_browse() {
                        receiver = fresh;
                    }
                }
                BrowseStep::Requery => {
                    tracing::debug!("Re-issuing browse query for {}", self.service_type);
                    if let Some(fresh) = self.restart_browse() {
                        receiver = fresh;
                    }
                }
                BrowseStep::Shutdown => {
                    tracing::info!("mDNS browser shutting down");
                    break;
                }
            }
        }

        self.started.store(false, Ordering::SeqCst);
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            tracing::warn!("Failed to stop browsing {}: {}", self.service_type, e);
        }

        Ok(())
    }

    /// A fresh browse makes the daemon send new queries. It replaces the
    /// previous listener for this type inside mdns-sd.
    fn restart_browse(&self) -> Option<flume::Receiver<ServiceEvent>> {
        match self.daemon.browse(&self.service_type) {
            Ok(receiver) => Some(receiver),
            Err(e) => {
                tracing::error!("Failed to restart browse for {}: {}", self.service_type, e);
                None
            }
        }
    }
}

#[async_trait]
impl ServiceResolver for MdnsBrowser {
    async fn resolve(
        &self,
        service_type: &str,
        name: &str,
        timeout: Duration,
    ) -> Option<ServiceAdvertisement> {
        if service_type != self.service_type {
            return None;
        }
        self.cache.resolve(name, timeout).await
    }

    fn requery(&self) {
        self.cache.mark_requery();
        self.requery.notify_one();
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
