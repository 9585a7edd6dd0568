use std::thread;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use anyhow::Result;
use shared::types::{DeviceDescriptor, DeviceRecord};
use crate::store::{db::DeviceDb, hash};

/// What one reconciliation batch did to the store.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub upserted: usize,
    pub failed: usize,
    pub marked_offline: u64,
    pub devices: Vec<DeviceRecord>,
}

/// Commands sent to the store thread
pub enum StoreCommand {
    Reconcile {
        devices: Vec<DeviceDescriptor>,
        now: DateTime<Utc>,
        offline_after: Duration,
        reply: oneshot::Sender<Result<ReconcileReport>>,
    },
    GetOne(String, oneshot::Sender<Result<Option<DeviceRecord>>>),
    Rename {
        identity_key: String,
        display_name: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Delete(String, oneshot::Sender<Result<bool>>),
    Shutdown,
}

/// Handle to the persistent device store.
///
/// All access runs on one dedicated thread, so writes for the same identity
/// key are applied one at a time.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn a new store thread with the given database
    pub fn spawn(db: DeviceDb, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        let recompute_hash = |db: &DeviceDb, hash_tx: &watch::Sender<String>| {
            if let Ok(devices) = db.get_all_devices() {
                hash_tx.send_if_modified(|current| {
                    let next = hash::compute_hash(&devices);
                    let modified = *current != next;
                    *current = next;
                    modified
                });
            }
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Reconcile { devices, now, offline_after, reply } => {
                        let report = reconcile_batch(&db, &devices, now, offline_after);
                        if report.upserted > 0 || report.marked_offline > 0 {
                            recompute_hash(&db, &hash_tx);
                        }
                        let _ = reply.send(Ok(report));
                    }
                    StoreCommand::GetOne(identity_key, reply) => {
                        let _ = reply.send(db.get_device(&identity_key));
                    }
                    StoreCommand::Rename { identity_key, display_name, reply } => {
                        let result = db.rename_device(&identity_key, &display_name);
                        if matches!(&result, Ok(true)) {
                            recompute_hash(&db, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::Delete(identity_key, reply) => {
                        let result = db.delete_device(&identity_key);
                        if matches!(&result, Ok(true)) {
                            recompute_hash(&db, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Upsert a batch of identified devices, then flip stale records offline,
    /// then list everything. Runs as one unit on the store thread.
    pub async fn reconcile(
        &self,
        devices: Vec<DeviceDescriptor>,
        now: DateTime<Utc>,
        offline_after: Duration,
    ) -> Result<ReconcileReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Reconcile { devices, now, offline_after, reply })
            .await?;
        rx.await?
    }

    pub async fn get_one(&self, identity_key: String) -> Result<Option<DeviceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetOne(identity_key, reply)).await?;
        rx.await?
    }

    /// Returns false if no record has this identity key
    pub async fn rename(&self, identity_key: String, display_name: String) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Rename { identity_key, display_name, reply })
            .await?;
        rx.await?
    }

    /// Returns false if no record has this identity key
    pub async fn delete(&self, identity_key: String) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Delete(identity_key, reply)).await?;
        rx.await?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

fn reconcile_batch(
    db: &DeviceDb,
    devices: &[DeviceDescriptor],
    now: DateTime<Utc>,
    offline_after: Duration,
) -> ReconcileReport {
    let mut upserted = 0;
    let mut failed = 0;

    for desc in devices {
        match db.upsert_device(desc, now) {
            Ok(_) => upserted += 1,
            Err(e) => {
                failed += 1;
                tracing::error!("Failed to upsert {}: {:#}", desc.name, e);
            }
        }
    }

    // After the upserts, so a record refreshed above is judged on its new last_seen
    let marked_offline = match db.mark_offline(now - offline_after) {
        Ok(count) => count,
        Err(e) => {
            tracing::error!("Failed to mark offline devices: {:#}", e);
            0
        }
    };

    // The writes above stand even when the listing fails
    let devices = db.get_all_devices().unwrap_or_else(|e| {
        tracing::error!("Failed to list devices after reconcile: {:#}", e);
        Vec::new()
    });

    ReconcileReport {
        upserted,
        failed,
        marked_offline,
        devices,
    }
}
