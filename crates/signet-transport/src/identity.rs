//! Device identity resolution
//!
//! A device is known by a USB connect id from the moment it is added, but
//! its Bluetooth handle is only learned on demand by scanning and pairing.

use signet_core::{CallContext, DeviceRecord, HardwareError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::driver::DeviceDriver;
use crate::negotiator::TransportNegotiator;
use crate::registry::DeviceRegistry;
use crate::settings::TransportSettings;
use crate::ui::{UiChannel, UserRequest, UserResponse};

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// How long the user has to confirm a pairing scan
    pub pairing_timeout: Duration,
    pub scan_attempts: u32,
    pub scan_interval: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(120),
            scan_attempts: 10,
            scan_interval: Duration::from_secs(3),
        }
    }
}

pub struct IdentityResolver {
    registry: Arc<dyn DeviceRegistry>,
    negotiator: Arc<TransportNegotiator>,
    settings: Arc<dyn TransportSettings>,
    driver: Arc<dyn DeviceDriver>,
    ui: UiChannel,
    config: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        negotiator: Arc<TransportNegotiator>,
        settings: Arc<dyn TransportSettings>,
        driver: Arc<dyn DeviceDriver>,
        ui: UiChannel,
        config: IdentityConfig,
    ) -> Self {
        Self {
            registry,
            negotiator,
            settings,
            driver,
            ui,
            config,
        }
    }

    /// Connection handle a call should use for the given device
    pub async fn resolve_connection_handle(
        &self,
        connect_id: Option<&str>,
        context: CallContext,
    ) -> Result<String> {
        let connect_id = match connect_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None if context == CallContext::UpdateFirmware => return Ok(String::new()),
            None => return Err(HardwareError::ConnectIdRequired),
        };
        let record = self.registry.find_by_connect_id(connect_id).await?;

        if context == CallContext::BackgroundTask {
            let ble = record.and_then(|r| r.ble_connect_id);
            return Ok(match ble {
                Some(ble) if self.settings.current_transport().await.is_ble() => ble,
                _ => connect_id.to_string(),
            });
        }

        let transport = self
            .negotiator
            .determine_transport(context, Some(connect_id))
            .await;
        if !transport.is_ble() {
            return Ok(connect_id.to_string());
        }

        let Some(record) = record else {
            return Ok(connect_id.to_string());
        };
        if let Some(ble) = &record.ble_connect_id {
            return Ok(ble.clone());
        }
        if self
            .negotiator
            .force_transport()
            .await
            .is_some_and(|forced| forced.is_ble())
        {
            // onboarding already holds the Bluetooth handle as the primary id
            return Ok(record.connect_id.clone());
        }
        if context.is_non_interactive() {
            return Ok(connect_id.to_string());
        }

        let request = UserRequest::BluetoothPairing {
            connect_id: connect_id.to_string(),
            device_name: record.ble_name.clone(),
        };
        match self.ui.request(request, self.config.pairing_timeout).await {
            Ok(UserResponse::Approved) => self.repair_ble_connect_id(&record).await,
            Ok(UserResponse::Denied) => {
                info!(device = %record.id, "Bluetooth pairing declined");
                Err(HardwareError::DeviceNotFound)
            }
            Err(e) => {
                warn!(device = %record.id, error = %e, "Bluetooth pairing request failed");
                Err(HardwareError::DeviceNotFound)
            }
        }
    }

    /// Find the device over Bluetooth, verify its serial and store the handle
    pub async fn repair_ble_connect_id(&self, record: &DeviceRecord) -> Result<String> {
        let Some(ble_name) = record.ble_name.as_deref() else {
            debug!(device = %record.id, "No stored Bluetooth name to match");
            return Err(HardwareError::DeviceNotFound);
        };

        let found = self
            .driver
            .search_devices()
            .await
            .map_err(|_| HardwareError::DeviceNotFound)?;
        let candidate = found
            .into_iter()
            .find(|d| d.transport.is_ble() && d.name == ble_name)
            .ok_or(HardwareError::DeviceNotFound)?;

        let features = self
            .driver
            .connect(&candidate.connect_id)
            .await
            .map_err(|_| HardwareError::DeviceNotFound)?;
        if features.device_id.as_deref() != Some(record.device_id.as_str()) {
            warn!(
                device = %record.id,
                name = %ble_name,
                "Bluetooth device serial does not match"
            );
            return Err(HardwareError::DeviceNotFound);
        }

        self.registry
            .update_connection_handles(&record.id, None, Some(candidate.connect_id.clone()))
            .await
            .map_err(|_| HardwareError::DeviceNotFound)?;
        info!(device = %record.id, ble = %candidate.connect_id, "Bluetooth handle stored");
        Ok(candidate.connect_id)
    }

    /// Poll the scan until the device shows up again
    pub async fn ensure_device_exist(&self, connect_id: &str) -> Result<bool> {
        for attempt in 1..=self.config.scan_attempts {
            match self.driver.search_devices().await {
                Ok(found) if found.iter().any(|d| d.connect_id == connect_id) => {
                    debug!(connect_id = %connect_id, attempt, "Device found");
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) => debug!(connect_id = %connect_id, error = %e, "Scan failed"),
            }
            if attempt < self.config.scan_attempts {
                tokio::time::sleep(self.config.scan_interval).await;
            }
        }
        Ok(false)
    }
}
