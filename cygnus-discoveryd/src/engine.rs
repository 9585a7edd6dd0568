use shared::types::{DeviceDescriptor, DeviceRecord};
use crate::discovery::prober::{ProbeReport, Prober};
use crate::error::{EngineError, EngineResult};
use crate::reconciler::Reconciler;
use crate::registry::LiveRegistry;
use crate::store_manager::StoreHandle;

/// The operations the HTTP layer is allowed to call.
#[derive(Clone)]
pub struct Engine {
    registry: LiveRegistry,
    store: StoreHandle,
    reconciler: Reconciler,
    prober: Prober,
}

impl Engine {
    pub fn new(registry: LiveRegistry, store: StoreHandle, reconciler: Reconciler, prober: Prober) -> Self {
        Self { registry, store, reconciler, prober }
    }

    /// Current registry contents, no side effects
    pub fn list_live_devices(&self) -> Vec<DeviceDescriptor> {
        self.registry.snapshot()
    }

    pub async fn reconcile_and_list(&self) -> Vec<DeviceRecord> {
        self.reconciler.reconcile_and_list().await
    }

    pub async fn force_probe(&self) -> EngineResult<ProbeReport> {
        if !self.prober.is_available() {
            return Err(EngineError::Unavailable("mDNS discovery has not started".to_string()));
        }
        Ok(self.prober.probe_once().await)
    }

    pub async fn get_device(&self, identity_key: &str) -> EngineResult<DeviceRecord> {
        let identity_key = required("identity key", identity_key)?;
        self.store
            .get_one(identity_key.clone())
            .await?
            .ok_or(EngineError::NotFound(identity_key))
    }

    pub async fn rename(&self, identity_key: &str, display_name: &str) -> EngineResult<()> {
        let identity_key = required("identity key", identity_key)?;
        let display_name = required("display name", display_name)?;

        if self.store.rename(identity_key.clone(), display_name).await? {
            Ok(())
        } else {
            Err(EngineError::NotFound(identity_key))
        }
    }

    pub async fn delete(&self, identity_key: &str) -> EngineResult<()> {
        let identity_key = required("identity key", identity_key)?;

        if self.store.delete(identity_key.clone()).await? {
            tracing::info!("Deleted device {}", identity_key);
            Ok(())
        } else {
            Err(EngineError::NotFound(identity_key))
        }
    }
}

fn required(what: &str, value: &str) -> EngineResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::InvalidInput(format!("{} is required", what)));
    }
    Ok(value.to_string())
}
