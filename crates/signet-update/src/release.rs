//! Release checking
//!
//! Reads the device, asks the driver for the latest release of each
//! component and turns the answers into a [`ReleaseCheckResult`] the
//! workflow can act on.

use signet_core::{
    CallContext, ComponentUpdateInfo, FeatureSnapshot, FirmwareComponent, FirmwareType,
    ForceUpdateOverrides, HardwareError, ReleaseCheckResult, Result, TransportKind, UpdateInfos,
    WorkflowState,
};
use signet_transport::{
    FeatureGate, IdentityResolver, SessionFacade, SessionHandle, StatusOptions, UiChannel, UiEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{ReleaseBackend, VerifyRequest, UNCHANGED_VERSION};
use crate::detect::DetectThrottle;
use crate::dev_settings::DevSettingsStore;
use crate::tasks::UpdateTaskQueue;

pub struct ReleaseChecker {
    session: Arc<SessionFacade>,
    gate: Arc<FeatureGate>,
    identity: Arc<IdentityResolver>,
    tasks: Arc<UpdateTaskQueue>,
    dev: Arc<DevSettingsStore>,
    backend: Arc<dyn ReleaseBackend>,
    detect: Arc<DetectThrottle>,
    ui: UiChannel,
    cancel_settle: Duration,
}

impl ReleaseChecker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionFacade>,
        gate: Arc<FeatureGate>,
        identity: Arc<IdentityResolver>,
        tasks: Arc<UpdateTaskQueue>,
        dev: Arc<DevSettingsStore>,
        backend: Arc<dyn ReleaseBackend>,
        detect: Arc<DetectThrottle>,
        ui: UiChannel,
        cancel_settle: Duration,
    ) -> Self {
        Self {
            session,
            gate,
            identity,
            tasks,
            dev,
            backend,
            detect,
            ui,
            cancel_settle,
        }
    }

    /// Check every component of the device behind `connect_id`.
    ///
    /// In-flight device calls are cancelled first unless `skip_cancel` is set.
    /// Failures are published as `check_release_error` before being returned.
    pub async fn check_all_firmware_release(
        &self,
        connect_id: Option<&str>,
        firmware_type: Option<FirmwareType>,
        skip_cancel: bool,
    ) -> Result<ReleaseCheckResult> {
        let display_id = connect_id.unwrap_or_default().to_string();
        self.publish(&display_id, WorkflowState::Init);
        self.tasks.set_retry(None);

        if !skip_cancel {
            if let Err(e) = self.session.cancel(connect_id).await {
                debug!(error = %e, "Cancel before release check failed");
            }
            tokio::time::sleep(self.cancel_settle).await;
        }

        match self.check_release(connect_id, firmware_type).await {
            Ok(result) => {
                info!(
                    connect_id = %result.connect_id,
                    device_type = %result.device_type,
                    has_upgrade = result.has_upgrade,
                    phases = ?result.total_phase,
                    "Release check finished"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(connect_id = %display_id, error = %e, "Release check failed");
                self.publish(
                    &display_id,
                    WorkflowState::CheckReleaseError {
                        error: e.to_payload(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn check_release(
        &self,
        connect_id: Option<&str>,
        firmware_type: Option<FirmwareType>,
    ) -> Result<ReleaseCheckResult> {
        let updating_id = self
            .identity
            .resolve_connection_handle(connect_id, CallContext::UpdateFirmware)
            .await?;
        let handle = self
            .session
            .get_session(Some(&updating_id), CallContext::UpdateFirmware)
            .await?;

        let opts = StatusOptions {
            allow_empty_connect_id: true,
        };
        let features = self
            .gate
            .get_status_fresh(Some(&updating_id), &opts)
            .await?;
        let dev = self.dev.get();
        let overrides = &dev.overrides;

        let mut infos = UpdateInfos {
            firmware: Some(
                self.component_info(&handle, &updating_id, FirmwareComponent::Firmware, &features, overrides)
                    .await?,
            ),
            ..Default::default()
        };

        let firmware_upgrade = infos
            .firmware
            .as_ref()
            .is_some_and(|f| f.has_upgrade && f.to_version.is_some());
        if firmware_upgrade {
            if handle.transport == TransportKind::Bridge {
                let mut bridge = self
                    .component_info(&handle, &updating_id, FirmwareComponent::Bridge, &features, overrides)
                    .await?;
                if dev.should_update_bridge {
                    bridge.release.should_update = true;
                }
                infos.bridge = Some(bridge);
            }
            if !infos.bridge_should_update() {
                infos.bootloader = Some(
                    self.component_info(&handle, &updating_id, FirmwareComponent::Bootloader, &features, overrides)
                        .await?,
                );
            }
        }

        if !infos.bridge_should_update() {
            infos.ble = Some(
                self.component_info(&handle, &updating_id, FirmwareComponent::Ble, &features, overrides)
                    .await?,
            );
        }

        let result_id = connect_id.filter(|id| !id.is_empty()).unwrap_or(&updating_id);
        let mut result = ReleaseCheckResult::new(result_id, features, infos, dev.all_is_up_to_date);
        if let Some(firmware_type) = firmware_type {
            result.firmware_type = firmware_type;
        }

        self.attach_release_urls(&mut result).await;
        Ok(result)
    }

    async fn component_info(
        &self,
        handle: &SessionHandle,
        connect_id: &str,
        component: FirmwareComponent,
        features: &FeatureSnapshot,
        overrides: &ForceUpdateOverrides,
    ) -> Result<ComponentUpdateInfo> {
        let release = handle.driver().check_release(connect_id, component).await?;
        let info = ComponentUpdateInfo::new(component, features, release, overrides);
        debug!(
            component = %component,
            from = ?info.from_version,
            to = ?info.to_version,
            has_upgrade = info.has_upgrade,
            "Component release checked"
        );
        Ok(info)
    }

    /// Ask the verification backend for release pages. Failures only lose the links.
    async fn attach_release_urls(&self, result: &mut ReleaseCheckResult) {
        let infos = &result.update_infos;
        let target = |component: FirmwareComponent| {
            infos
                .get(component)
                .filter(|i| i.has_upgrade)
                .and_then(|i| i.to_version.clone())
                .unwrap_or_else(|| UNCHANGED_VERSION.to_string())
        };
        let request = VerifyRequest {
            device_type: result.device_type,
            firmware_version: target(FirmwareComponent::Firmware),
            ble_version: target(FirmwareComponent::Ble),
            bootloader_version: target(FirmwareComponent::Bootloader),
            firmware_type: result.firmware_type,
        };

        let verified = match self.backend.fetch_verified_version_info(&request).await {
            Ok(verified) => verified,
            Err(e) => {
                warn!(error = %e, "Release verification unavailable");
                return;
            }
        };

        for component in [
            FirmwareComponent::Firmware,
            FirmwareComponent::Ble,
            FirmwareComponent::Bootloader,
        ] {
            let Some(info) = result.update_infos.get_mut(component) else {
                continue;
            };
            if !info.has_upgrade {
                continue;
            }
            if let Some(urls) = verified.get(component) {
                info.release_urls = Some(urls.clone());
            }
        }
    }

    /// Background check whether a known device sits in bootloader mode.
    ///
    /// Runs at most once per detect interval per device. A device that is
    /// not attached is not an error here.
    pub async fn detect_firmware_update(&self, connect_id: &str) -> Result<bool> {
        if connect_id.is_empty() || !self.detect.should_detect(connect_id) {
            return Ok(false);
        }
        self.detect.mark_detected(connect_id);

        let handle = self
            .identity
            .resolve_connection_handle(Some(connect_id), CallContext::BackgroundTask)
            .await?;
        match self
            .gate
            .get_status_fresh(Some(&handle), &StatusOptions::default())
            .await
        {
            Ok(features) => {
                let bootloader = features.is_bootloader_mode();
                if bootloader {
                    info!(connect_id = %connect_id, "Device detected in bootloader mode");
                }
                Ok(bootloader)
            }
            Err(HardwareError::DeviceNotFound) => {
                debug!(connect_id = %connect_id, "Device not attached, skipping detection");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Postpone the next automatic check by the regular interval, or by `delay`
    pub fn delay_detect(&self, connect_id: &str, delay: Option<Duration>) {
        match delay {
            Some(delay) => self.detect.delay(connect_id, delay),
            None => self.detect.mark_detected(connect_id),
        }
    }

    pub fn reset_detect(&self, connect_id: &str) {
        self.detect.reset(connect_id);
    }

    fn publish(&self, connect_id: &str, state: WorkflowState) {
        self.ui.publish(UiEvent::Workflow {
            connect_id: connect_id.to_string(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{make_context, make_context_with};
    use signet_core::{ReleaseDescriptor, ReleaseStatus};
    use signet_transport::testing::FakeDriver;

    fn outdated(target: &str) -> ReleaseDescriptor {
        ReleaseDescriptor {
            status: ReleaseStatus::Outdated,
            target_version: Some(target.to_string()),
            has_release: true,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_check_collects_phases() {
        let driver = FakeDriver::new();
        driver.set_release(FirmwareComponent::Firmware, outdated("4.1.0"));
        driver.set_release(FirmwareComponent::Bootloader, outdated("2.6.0"));
        driver.set_release(FirmwareComponent::Ble, outdated("2.1.0"));
        let f = make_context(driver.clone()).await;

        let result = f
            .ctx
            .release
            .check_all_firmware_release(Some("usb-1"), None, false)
            .await
            .unwrap();

        assert!(result.has_upgrade);
        // ble target equals the installed version
        assert_eq!(
            result.total_phase,
            vec![FirmwareComponent::Bootloader, FirmwareComponent::Firmware]
        );
        assert_eq!(result.connect_id, "usb-1");
        assert!(driver.count_calls("cancel") >= 1);
        assert_eq!(driver.count_calls("check_release:bridge"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_update_skips_device_components() {
        let driver = FakeDriver::new();
        driver.set_release(FirmwareComponent::Firmware, outdated("4.1.0"));
        driver.set_release(FirmwareComponent::Bootloader, outdated("2.6.0"));
        let f = make_context(driver.clone()).await;
        f.ctx.dev.update(|d| d.should_update_bridge = true);

        let result = f
            .ctx
            .release
            .check_all_firmware_release(Some("usb-1"), None, true)
            .await
            .unwrap();

        assert!(result.update_infos.bridge_should_update());
        assert!(result.update_infos.bootloader.is_none());
        assert!(result.update_infos.ble.is_none());
        assert_eq!(driver.count_calls("cancel"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_up_to_date_mock() {
        let driver = FakeDriver::new();
        driver.set_release(FirmwareComponent::Firmware, outdated("4.1.0"));
        let f = make_context(driver).await;
        f.ctx.dev.update(|d| d.all_is_up_to_date = true);

        let result = f
            .ctx
            .release
            .check_all_firmware_release(Some("usb-1"), None, true)
            .await
            .unwrap();
        assert!(!result.has_upgrade);
        assert_eq!(result.total_phase, vec![FirmwareComponent::Firmware]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_urls_attached_only_for_upgrades() {
        let driver = FakeDriver::new();
        driver.set_release(FirmwareComponent::Firmware, outdated("4.1.0"));
        let f = make_context(driver).await;

        let result = f
            .ctx
            .release
            .check_all_firmware_release(Some("usb-1"), None, true)
            .await
            .unwrap();
        let firmware = result.update_infos.firmware.unwrap();
        assert_eq!(
            firmware
                .release_urls
                .and_then(|u| u.github_release_url),
            Some("https://releases.example/firmware/4.1.0".to_string())
        );
        assert!(result.update_infos.ble.unwrap().release_urls.is_none());

        let requests = f.backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].firmware_version, "4.1.0");
        assert_eq!(requests[0].ble_version, UNCHANGED_VERSION);
        assert_eq!(requests[0].bootloader_version, UNCHANGED_VERSION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_is_not_fatal() {
        let driver = FakeDriver::new();
        driver.set_release(FirmwareComponent::Firmware, outdated("4.1.0"));
        let f = make_context(driver).await;
        f.backend.set_failing(true);

        let result = f
            .ctx
            .release
            .check_all_firmware_release(Some("usb-1"), None, true)
            .await
            .unwrap();
        assert!(result.has_upgrade);
        assert!(result.update_infos.firmware.unwrap().release_urls.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_publishes_check_release_error() {
        let driver = FakeDriver::new();
        driver.set_versions(vec![("core", "1.0.0"), ("transport", "2.0.0")]);
        let f = make_context_with(driver, |c| c.transport.strict_driver_versions = true).await;
        let mut events = f.ctx.ui.subscribe();

        let err = f
            .ctx
            .release
            .check_all_firmware_release(Some("usb-1"), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::DriverMismatch(_)));

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let UiEvent::Workflow { state, .. } = event {
                states.push(state);
            }
        }
        assert!(matches!(states.first(), Some(WorkflowState::Init)));
        match states.last() {
            Some(WorkflowState::CheckReleaseError { error }) => {
                assert_eq!(error.code, "driver_mismatch")
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_throttled_and_reports_bootloader() {
        let driver = FakeDriver::new();
        let mut snapshot = FakeDriver::default_snapshot();
        snapshot.bootloader_mode = true;
        driver.set_snapshot(snapshot);
        let f = make_context(driver.clone()).await;

        assert!(f.ctx.release.detect_firmware_update("usb-1").await.unwrap());
        let reads = driver.count_calls("read_status");
        // second call inside the interval does not touch the device
        assert!(!f.ctx.release.detect_firmware_update("usb-1").await.unwrap());
        assert_eq!(driver.count_calls("read_status"), reads);

        f.ctx.release.reset_detect("usb-1");
        assert!(f.ctx.release.detect_firmware_update("usb-1").await.unwrap());
    }
}
