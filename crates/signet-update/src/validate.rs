//! Preconditions checked before any update phase runs
//!
//! Each check either passes or aborts the workflow with a validation error.
//! Nothing on the device or in the registry is touched here.

use signet_core::{
    version_gte, version_lt, ComponentUpdateInfo, DeviceType, HardwareError, Result,
};
use signet_transport::Platform;
use tracing::{debug, warn};

use crate::config::ValidationConfig;
use crate::dev_settings::DevSettings;
use crate::workflow::UpdateWorkflowParams;

/// Battery level reported while the low-battery mock is on
const MOCK_LOW_BATTERY_LEVEL: u8 = 1;

pub struct UpdateValidator {
    config: ValidationConfig,
    platform: Platform,
}

impl UpdateValidator {
    pub fn new(config: ValidationConfig, platform: Platform) -> Self {
        Self { config, platform }
    }

    /// Run every precondition in order; the first failure wins
    pub fn validate_all(&self, params: &UpdateWorkflowParams, dev: &DevSettings) -> Result<()> {
        validate_backup(params)?;
        validate_usb_connection(params)?;
        // must run before the version floor so the user is sent to the desktop updater
        self.validate_full_resource(params, dev)?;
        self.validate_min_version(params, dev)?;
        self.validate_battery(params, dev)?;
        validate_bridge(params)?;
        debug!(connect_id = %params.release.connect_id, "Update preconditions passed");
        Ok(())
    }

    /// Touch devices crossing the resource layout change need the desktop updater
    pub fn validate_full_resource(
        &self,
        params: &UpdateWorkflowParams,
        dev: &DevSettings,
    ) -> Result<()> {
        if dev.should_update_full_res || self.needs_full_resource(params) {
            return Err(HardwareError::UseDesktopToUpdate);
        }
        Ok(())
    }

    fn needs_full_resource(&self, params: &UpdateWorkflowParams) -> bool {
        if params.release.device_type != DeviceType::Touch {
            return false;
        }
        let Some(firmware) = &params.release.update_infos.firmware else {
            return false;
        };
        let (Some(from), Some(to)) = (&firmware.from_version, &firmware.to_version) else {
            return false;
        };
        let [min, limit] = &self.config.full_resource_range;
        version_lt(from, min).unwrap_or(false) && version_gte(to, limit).unwrap_or(false)
    }

    pub fn validate_min_version(
        &self,
        params: &UpdateWorkflowParams,
        dev: &DevSettings,
    ) -> Result<()> {
        if dev.should_update_from_web {
            return Err(HardwareError::UpgradeFromWebRequired);
        }

        let release = &params.release;
        let floors = self.config.min_versions_for(release.device_type);
        let infos = &release.update_infos;

        // firmware versions read in bootloader mode are unreliable, only the bootloader counts
        if release.is_bootloader_mode {
            check_floor(
                infos.bootloader.as_ref(),
                floors.and_then(|f| f.bootloader.as_deref()),
            )?;
            if let Some(bootloader) = &infos.bootloader {
                if bootloader.has_upgrade && bootloader.from_version.is_none() {
                    return Err(HardwareError::UpgradeFromWebRequired);
                }
            }
            return Ok(());
        }

        check_floor(
            infos.firmware.as_ref(),
            floors.and_then(|f| f.firmware.as_deref()),
        )?;
        check_floor(infos.ble.as_ref(), floors.and_then(|f| f.ble.as_deref()))?;

        if !dev.update_dev_device_bootloader_on_app_allowed {
            let floor = floors
                .and_then(|f| f.bootloader.as_deref())
                .unwrap_or(&self.config.default_bootloader_floor);
            check_floor(infos.bootloader.as_ref(), Some(floor))?;
        }
        Ok(())
    }

    /// Native hosts only; USB hosts power the device
    pub fn validate_battery(&self, params: &UpdateWorkflowParams, dev: &DevSettings) -> Result<()> {
        if self.platform != Platform::Native {
            return Ok(());
        }
        let level = if dev.low_battery_level {
            Some(MOCK_LOW_BATTERY_LEVEL)
        } else {
            params.release.features.battery_level
        };
        let Some(level) = level else {
            return Ok(());
        };
        if level <= self.config.min_battery_level {
            warn!(level, min = self.config.min_battery_level, "Battery too low to update");
            return Err(HardwareError::BatteryTooLow {
                level,
                min: self.config.min_battery_level,
            });
        }
        Ok(())
    }
}

pub fn validate_backup(params: &UpdateWorkflowParams) -> Result<()> {
    if params.backed_up {
        Ok(())
    } else {
        Err(HardwareError::NotBackedUp)
    }
}

pub fn validate_usb_connection(params: &UpdateWorkflowParams) -> Result<()> {
    if params.usb_connected {
        Ok(())
    } else {
        Err(HardwareError::UsbNotConnected)
    }
}

pub fn validate_bridge(params: &UpdateWorkflowParams) -> Result<()> {
    if params.release.update_infos.bridge_should_update() {
        Err(HardwareError::BridgeUpgradeRequired)
    } else {
        Ok(())
    }
}

fn check_floor(info: Option<&ComponentUpdateInfo>, floor: Option<&str>) -> Result<()> {
    let (Some(info), Some(floor)) = (info, floor) else {
        return Ok(());
    };
    if !info.has_upgrade {
        return Ok(());
    }
    let Some(from) = info.from_version.as_deref() else {
        return Ok(());
    };
    if version_lt(from, floor).unwrap_or(false) {
        warn!(component = %info.component, from = %from, floor = %floor, "Installed version below in-app floor");
        return Err(HardwareError::UpgradeFromWebRequired);
    }
    Ok(())
}
