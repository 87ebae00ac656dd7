//! Persisted device registry boundary

use async_trait::async_trait;
use signet_core::{
    DeviceId, DeviceRecord, DeviceVersions, FeatureSnapshot, FirmwareType, HardwareError, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Device records owned by the host application.
///
/// Records are only ever updated from here, never deleted.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Match either the USB or the Bluetooth connect id
    async fn find_by_connect_id(&self, connect_id: &str) -> Result<Option<DeviceRecord>>;

    async fn find_by_id(&self, id: &DeviceId) -> Result<Option<DeviceRecord>>;

    async fn update_connection_handles(
        &self,
        id: &DeviceId,
        usb: Option<String>,
        bluetooth: Option<String>,
    ) -> Result<()>;

    async fn update_cached_versions(
        &self,
        id: &DeviceId,
        versions: DeviceVersions,
        firmware_type: FirmwareType,
    ) -> Result<()>;

    async fn set_force_recheck_firmware(&self, id: &DeviceId, value: bool) -> Result<()>;

    async fn update_features(&self, connect_id: &str, features: FeatureSnapshot) -> Result<()>;
}

/// Registry kept in memory, keyed by device id
#[derive(Default)]
pub struct InMemoryDeviceRegistry {
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: DeviceRecord) {
        self.devices
            .write()
            .await
            .insert(record.id.0.clone(), record);
    }

    pub async fn devices(&self) -> Vec<DeviceRecord> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn update<F>(&self, id: &DeviceId, f: F) -> Result<()>
    where
        F: FnOnce(&mut DeviceRecord) + Send,
    {
        let mut devices = self.devices.write().await;
        let record = devices.get_mut(&id.0).ok_or(HardwareError::DeviceNotFound)?;
        f(record);
        record.touch();
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn find_by_connect_id(&self, connect_id: &str) -> Result<Option<DeviceRecord>> {
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .find(|d| {
                d.connect_id == connect_id || d.ble_connect_id.as_deref() == Some(connect_id)
            })
            .cloned())
    }

    async fn find_by_id(&self, id: &DeviceId) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.read().await.get(&id.0).cloned())
    }

    async fn update_connection_handles(
        &self,
        id: &DeviceId,
        usb: Option<String>,
        bluetooth: Option<String>,
    ) -> Result<()> {
        debug!(device = %id, ?usb, ?bluetooth, "Updating connection handles");
        self.update(id, |record| {
            if let Some(usb) = usb {
                record.connect_id = usb;
            }
            if let Some(bluetooth) = bluetooth {
                record.ble_connect_id = Some(bluetooth);
            }
        })
        .await
    }

    async fn update_cached_versions(
        &self,
        id: &DeviceId,
        versions: DeviceVersions,
        firmware_type: FirmwareType,
    ) -> Result<()> {
        self.update(id, |record| {
            record.versions = versions;
            record.firmware_type = firmware_type;
        })
        .await
    }

    async fn set_force_recheck_firmware(&self, id: &DeviceId, value: bool) -> Result<()> {
        self.update(id, |record| record.force_recheck_firmware = value)
            .await
    }

    async fn update_features(&self, connect_id: &str, features: FeatureSnapshot) -> Result<()> {
        let Some(record) = self.find_by_connect_id(connect_id).await? else {
            debug!(connect_id = %connect_id, "Features for unknown device ignored");
            return Ok(());
        };
        self.update(&record.id, |record| record.features = Some(features))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signet_core::DeviceType;

    #[tokio::test]
    async fn test_find_by_either_handle() {
        let registry = InMemoryDeviceRegistry::new();
        let mut record =
            DeviceRecord::new(DeviceId::new("dev-1"), "usb-1", "SERIAL-1", DeviceType::Pro);
        record.ble_connect_id = Some("ble-1".to_string());
        registry.insert(record).await;

        assert!(registry.find_by_connect_id("usb-1").await.unwrap().is_some());
        assert!(registry.find_by_connect_id("ble-1").await.unwrap().is_some());
        assert!(registry.find_by_connect_id("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_device() {
        let registry = InMemoryDeviceRegistry::new();
        let err = registry
            .set_force_recheck_firmware(&DeviceId::new("missing"), false)
            .await
            .unwrap_err();
        assert_eq!(err, HardwareError::DeviceNotFound);
    }
}
