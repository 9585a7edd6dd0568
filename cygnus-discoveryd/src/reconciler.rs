use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use shared::types::{DeviceDescriptor, DeviceRecord};
use crate::registry::LiveRegistry;
use crate::store_manager::StoreHandle;

/// Merges the live registry into the persistent store.
#[derive(Clone)]
pub struct Reconciler {
    registry: LiveRegistry,
    store: StoreHandle,
    offline_after: chrono::Duration,
}

impl Reconciler {
    pub fn new(registry: LiveRegistry, store: StoreHandle, offline_after_secs: u64) -> Self {
        Self {
            registry,
            store,
            offline_after: crate::config::window(offline_after_secs),
        }
    }

    pub async fn reconcile_and_list(&self) -> Vec<DeviceRecord> {
        self.reconcile_at(Utc::now()).await
    }

    /// Snapshot the registry, upsert every identified device, flip stale
    /// records offline and return the whole store. Never fails: store
    /// errors are logged and an empty list is returned instead.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Vec<DeviceRecord> {
        let (tracked, anonymous): (Vec<DeviceDescriptor>, Vec<DeviceDescriptor>) = self
            .registry
            .snapshot()
            .into_iter()
            .partition(|desc| desc.identity_key.as_deref().is_some_and(|key| !key.is_empty()));

        for desc in &anonymous {
            tracing::debug!("Not persisting {}: no identity key", desc.name);
        }

        match self.store.reconcile(tracked, now, self.offline_after).await {
            Ok(report) => {
                if report.failed > 0 || report.marked_offline > 0 {
                    tracing::info!(
                        "Reconciled {} devices ({} failed), {} marked offline",
                        report.upserted,
                        report.failed,
                        report.marked_offline
                    );
                }
                report.devices
            }
            Err(e) => {
                tracing::error!("Reconciliation failed: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Optional background reconciliation alongside the read-triggered one.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_and_list().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Reconcile loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::watch;
    use shared::types::{DeviceStatus, ServiceCapability};
    use crate::registry::tests::descriptor;
    use crate::store::db::DeviceDb;
    use crate::store::hash::compute_hash;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn setup() -> (LiveRegistry, StoreHandle, Reconciler) {
        let db = DeviceDb::open(":memory:").unwrap();
        let (hash_tx, _) = watch::channel(compute_hash(&[]));
        let store = StoreHandle::spawn(db, hash_tx);
        let registry = LiveRegistry::new();
        let reconciler = Reconciler::new(registry.clone(), store.clone(), 60);
        (registry, store, reconciler)
    }

    #[tokio::test]
    async fn test_online_then_offline_after_timeout() {
        let (registry, _store, reconciler) = setup();
        registry.upsert(descriptor("lobby", Some("111222333"), t(0)));

        let first = reconciler.reconcile_at(t(0)).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, DeviceStatus::Online);
        assert_eq!(first[0].first_seen, t(0));
        assert_eq!(first[0].last_seen, t(0));
        assert_eq!(
            first[0].services["modbus"],
            ServiceCapability { port: Some(502), enabled: true }
        );

        let later = reconciler.reconcile_at(t(61)).await;
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].status, DeviceStatus::Offline);
        assert_eq!(later[0].first_seen, t(0));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (registry, _store, reconciler) = setup();
        registry.upsert(descriptor("lobby", Some("1"), t(0)));

        let first = reconciler.reconcile_at(t(0)).await;
        let second = reconciler.reconcile_at(t(0)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_anonymous_devices_stay_live_only() {
        let (registry, _store, reconciler) = setup();
        registry.upsert(descriptor("anon", None, t(0)));
        registry.upsert(descriptor("known", Some("1"), t(0)));

        let persisted = reconciler.reconcile_at(t(0)).await;

        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].identity_key, "1");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_first_seen_fixed_across_reboots() {
        let (registry, _store, reconciler) = setup();
        registry.upsert(descriptor("lobby", Some("1"), t(0)));
        reconciler.reconcile_at(t(0)).await;

        registry.remove("lobby._cygnus._tcp.local.");
        registry.upsert(descriptor("lobby-rebooted", Some("1"), t(300)));
        let records = reconciler.reconcile_at(t(300)).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "lobby-rebooted._cygnus._tcp.local.");
        assert_eq!(records[0].first_seen, t(0));
        assert_eq!(records[0].status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_offline_device_comes_back_online() {
        let (registry, _store, reconciler) = setup();
        registry.upsert(descriptor("lobby", Some("1"), t(0)));
        reconciler.reconcile_at(t(0)).await;
        assert_eq!(reconciler.reconcile_at(t(100)).await[0].status, DeviceStatus::Offline);

        registry.upsert(descriptor("lobby", Some("1"), t(110)));
        assert_eq!(reconciler.reconcile_at(t(110)).await[0].status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_store_down_yields_empty_list() {
        let (registry, store, reconciler) = setup();
        registry.upsert(descriptor("lobby", Some("1"), t(0)));
        store.shutdown().await.unwrap();

        assert!(reconciler.reconcile_at(t(0)).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_reconciles_keep_one_row() {
        let (registry, _store, reconciler) = setup();
        registry.upsert(descriptor("lobby", Some("1"), t(0)));

        let handles: Vec<_> = [5, 0, 3, 0]
            .into_iter()
            .map(|secs| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.reconcile_at(t(secs)).await })
            })
            .collect();
        let (late, early) = tokio::join!(reconciler.reconcile_at(t(5)), reconciler.reconcile_at(t(0)));
        for handle in handles {
            assert_eq!(handle.await.unwrap().len(), 1);
        }
        assert_eq!(late.len(), 1);
        assert_eq!(early.len(), 1);

        let records = reconciler.reconcile_at(t(5)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_seen, t(0));
        assert_eq!(records[0].last_seen, t(0));
        assert_eq!(records[0].status, DeviceStatus::Online);
    }
}
