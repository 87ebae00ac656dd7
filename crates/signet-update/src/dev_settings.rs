//! Developer settings for exercising update paths on real devices

use serde::{Deserialize, Serialize};
use signet_core::ForceUpdateOverrides;
use std::sync::RwLock;
use tracing::info;

/// Developer toggles. Everything defaults to off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevSettings {
    #[serde(flatten)]
    pub overrides: ForceUpdateOverrides,
    /// Report every component as up to date
    pub all_is_up_to_date: bool,
    /// Pretend the bridge daemon needs an update
    pub should_update_bridge: bool,
    /// Pretend a full resource update is needed
    pub should_update_full_res: bool,
    /// Pretend the installed version is below the in-app floor
    pub should_update_from_web: bool,
    /// Pretend the battery is nearly empty
    pub low_battery_level: bool,
    /// Skip the bootloader floor for development devices
    pub update_dev_device_bootloader_on_app_allowed: bool,
    /// Push the resource bundle even when the firmware version is unchanged
    pub force_update_res_even_same_version: bool,
}

/// Shared, mutable view of the developer settings
#[derive(Debug, Default)]
pub struct DevSettingsStore {
    inner: RwLock<DevSettings>,
}

impl DevSettingsStore {
    pub fn new(settings: DevSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn get(&self) -> DevSettings {
        self.inner
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn overrides(&self) -> ForceUpdateOverrides {
        self.get().overrides
    }

    pub fn update(&self, f: impl FnOnce(&mut DevSettings)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    /// Drop the one-shot force flags once an update went through
    pub fn clear_once(&self) {
        self.update(|s| s.overrides.clear_once());
        info!("Cleared one-shot force update flags");
    }
}
