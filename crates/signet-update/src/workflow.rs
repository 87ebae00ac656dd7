//! Update workflow orchestrator
//!
//! Drives one device through its update phases:
//!
//! ```text
//! settle -> preconditions -> [bootloader] -> [firmware] -> [ble] -> done
//! ```
//!
//! Every install runs through the [`UpdateTaskQueue`], so a failed phase
//! waits for a user retry instead of aborting the workflow. The device
//! reboots between phases; the waits for that are fixed and not cancellable.

use serde_json::Value;
use signet_core::firmware::parse_version;
use signet_core::{
    CallContext, ComponentUpdateInfo, DeviceType, DeviceVersions, FirmwareComponent,
    FirmwareType, HardwareError, InstallingInfo, ReleaseCheckResult, Result, TransportKind,
    VersionMismatch, WorkflowState,
};
use signet_transport::{
    DeviceRegistry, FeatureGate, IdentityResolver, InstallAllRequest, InstallRequest, SessionFacade,
    SessionHandle, StatusOptions, TransportSettings, UiChannel, UiEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ms, RebootDelays, UpdateConfig};
use crate::detect::DetectThrottle;
use crate::dev_settings::DevSettingsStore;
use crate::tasks::UpdateTaskQueue;
use crate::validate::UpdateValidator;

/// Input of one workflow run, as confirmed by the user
#[derive(Debug, Clone)]
pub struct UpdateWorkflowParams {
    pub release: ReleaseCheckResult,
    pub backed_up: bool,
    pub usb_connected: bool,
    /// Firmware flavour to install; the installed one when unset
    pub firmware_type: Option<FirmwareType>,
}

/// Points in the workflow where the device is given time to reboot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPhase {
    NextPhase,
    Retry,
    BleDone,
    BootDone,
    Done,
}

pub fn reboot_delay(
    phase: RebootPhase,
    device_type: DeviceType,
    transport: TransportKind,
    delays: &RebootDelays,
) -> Duration {
    let touch = device_type.is_touch_family();
    let value = match phase {
        RebootPhase::NextPhase if transport == TransportKind::WebUsb => delays.next_phase_webusb_ms,
        RebootPhase::NextPhase => delays.next_phase_ms,
        RebootPhase::Retry => delays.retry_ms,
        RebootPhase::BleDone if touch => delays.ble_done_ms,
        RebootPhase::BootDone if touch => delays.bootloader_done_ms,
        RebootPhase::BleDone | RebootPhase::BootDone => 0,
        RebootPhase::Done if device_type == DeviceType::Mini => delays.done_mini_ms,
        RebootPhase::Done => delays.done_ms,
    };
    ms(value)
}

/// Everything an install task needs, cloned into each task closure
#[derive(Clone)]
struct PhaseInstaller {
    session: Arc<SessionFacade>,
    identity: Arc<IdentityResolver>,
    ui: UiChannel,
    verify_wait: Duration,
}

impl PhaseInstaller {
    async fn session_for(&self, connect_id: &str) -> Result<(String, SessionHandle)> {
        let handle_id = self
            .identity
            .resolve_connection_handle(Some(connect_id), CallContext::UpdateFirmware)
            .await?;
        let session = self
            .session
            .get_session(Some(&handle_id), CallContext::UpdateFirmware)
            .await?;
        Ok((handle_id, session))
    }

    fn publish_installing(&self, release: &ReleaseCheckResult, phase: Option<FirmwareComponent>) {
        self.ui.publish(UiEvent::Workflow {
            connect_id: release.connect_id.clone(),
            state: WorkflowState::Installing(InstallingInfo {
                current_phase: phase,
                total_phase: release.total_phase.clone(),
                update_info: Some(Box::new(release.clone())),
            }),
        });
    }

    async fn install_bootloader(
        &self,
        release: &ReleaseCheckResult,
        request: &InstallRequest,
    ) -> Result<Value> {
        let (handle_id, session) = self.session_for(&release.connect_id).await?;
        self.publish_installing(release, Some(FirmwareComponent::Bootloader));

        if release.device_type.is_touch_family() {
            session.driver().update_bootloader(&handle_id).await?;
        } else {
            session.driver().install_firmware(&handle_id, request).await?;
        }
        info!(connect_id = %release.connect_id, "Bootloader installed");
        Ok(Value::Null)
    }

    async fn install_component(
        &self,
        release: &ReleaseCheckResult,
        request: &InstallRequest,
    ) -> Result<Value> {
        let (handle_id, session) = self.session_for(&release.connect_id).await?;
        self.publish_installing(release, Some(request.component));
        session.driver().install_firmware(&handle_id, request).await?;
        info!(
            connect_id = %release.connect_id,
            component = %request.component,
            version = ?request.target_version,
            "Component installed"
        );
        Ok(Value::Null)
    }

    async fn install_all(
        &self,
        release: &ReleaseCheckResult,
        request: &InstallAllRequest,
    ) -> Result<Value> {
        let (handle_id, session) = self.session_for(&release.connect_id).await?;
        self.publish_installing(release, None);

        let installed = session.driver().install_all(&handle_id, request).await?;
        let mismatches = verify_installed(request, &installed);

        tokio::time::sleep(self.verify_wait).await;
        if !mismatches.is_empty() {
            warn!(connect_id = %release.connect_id, ?mismatches, "Installed versions do not match");
            return Err(HardwareError::VersionMismatchAfterInstall(mismatches));
        }
        serde_json::to_value(&installed).map_err(|e| HardwareError::Decode(e.to_string()))
    }
}

/// Requested versions that were not reported back after a single-shot install
fn verify_installed(request: &InstallAllRequest, installed: &DeviceVersions) -> Vec<VersionMismatch> {
    let targets = [
        (FirmwareComponent::Firmware, &request.firmware_version, &installed.firmware),
        (FirmwareComponent::Ble, &request.ble_version, &installed.ble),
        (FirmwareComponent::Bootloader, &request.bootloader_version, &installed.bootloader),
    ];
    targets
        .into_iter()
        .filter_map(|(component, expected, actual)| {
            let expected = expected.as_deref()?;
            let wanted = parse_version(expected)?;
            if parse_version(actual).is_some_and(|v| v == wanted) {
                return None;
            }
            Some(VersionMismatch {
                component,
                expected: expected.to_string(),
                actual: Some(actual.clone()).filter(|a| !a.is_empty()),
            })
        })
        .collect()
}

pub struct UpdateWorkflow {
    session: Arc<SessionFacade>,
    gate: Arc<FeatureGate>,
    identity: Arc<IdentityResolver>,
    registry: Arc<dyn DeviceRegistry>,
    settings: Arc<dyn TransportSettings>,
    tasks: Arc<UpdateTaskQueue>,
    dev: Arc<DevSettingsStore>,
    detect: Arc<DetectThrottle>,
    validator: UpdateValidator,
    ui: UiChannel,
    config: UpdateConfig,
}

impl UpdateWorkflow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionFacade>,
        gate: Arc<FeatureGate>,
        identity: Arc<IdentityResolver>,
        registry: Arc<dyn DeviceRegistry>,
        settings: Arc<dyn TransportSettings>,
        tasks: Arc<UpdateTaskQueue>,
        dev: Arc<DevSettingsStore>,
        detect: Arc<DetectThrottle>,
        validator: UpdateValidator,
        ui: UiChannel,
        config: UpdateConfig,
    ) -> Self {
        Self {
            session,
            gate,
            identity,
            registry,
            settings,
            tasks,
            dev,
            detect,
            validator,
            ui,
            config,
        }
    }

    /// Install every component that has an upgrade, one phase at a time
    pub async fn start_update_workflow(&self, params: &UpdateWorkflowParams) -> Result<()> {
        info!(
            connect_id = %params.release.connect_id,
            phases = ?params.release.total_phase,
            "Starting update workflow"
        );
        let result = self.run_phases(params).await;
        self.report(params, result)
    }

    /// Single-shot install for devices whose bootloader takes every target at once
    pub async fn start_update_workflow_v3(
        &self,
        params: &UpdateWorkflowParams,
    ) -> Result<DeviceVersions> {
        info!(connect_id = %params.release.connect_id, "Starting single-shot update workflow");
        let result = self.run_single_shot(params).await;
        self.report(params, result)
    }

    /// Run a failed phase again; the workflow waiting on it resumes on success
    pub async fn retry_update_task(&self, task_id: Uuid, release: Option<&ReleaseCheckResult>) {
        let connect_id = release.map(|r| r.connect_id.as_str());
        self.tasks.retry_task(task_id, connect_id, release).await;
    }

    async fn run_phases(&self, params: &UpdateWorkflowParams) -> Result<()> {
        self.prepare(params).await?;

        let release = Arc::new(params.release.clone());
        let infos = &release.update_infos;
        let mut reboot_pending = false;

        self.tasks.ensure_running()?;
        if infos.has_upgrade(FirmwareComponent::Bootloader) {
            self.wait_next_phase(&release, &mut reboot_pending).await;
            self.start_bootloader_task(&release, params).await?;
            reboot_pending = true;
            self.wait_reboot(RebootPhase::BootDone, &release).await;
        }

        if let Some(firmware) = infos.firmware.as_ref().filter(|i| i.has_upgrade) {
            self.wait_next_phase(&release, &mut reboot_pending).await;
            self.tasks.ensure_running()?;
            self.start_component_task(&release, firmware, params).await?;
            reboot_pending = true;
        }

        if let Some(ble) = infos.ble.as_ref().filter(|i| i.has_upgrade) {
            self.wait_next_phase(&release, &mut reboot_pending).await;
            self.tasks.ensure_running()?;
            self.start_component_task(&release, ble, params).await?;
            self.wait_reboot(RebootPhase::BleDone, &release).await;
        }

        self.finish(&release).await
    }

    async fn run_single_shot(&self, params: &UpdateWorkflowParams) -> Result<DeviceVersions> {
        if params.release.device_type != DeviceType::Pro {
            return Err(HardwareError::UnsupportedDevice(params.release.device_type));
        }
        self.prepare(params).await?;
        self.tasks.ensure_running()?;

        let release = Arc::new(params.release.clone());

        let infos = &release.update_infos;
        let target = |component| {
            infos
                .get(component)
                .filter(|i| i.has_upgrade)
                .and_then(|i| i.to_version.clone())
        };
        let request = InstallAllRequest {
            bootloader_version: target(FirmwareComponent::Bootloader),
            firmware_version: target(FirmwareComponent::Firmware),
            ble_version: target(FirmwareComponent::Ble),
            platform: self.config.platform,
            firmware_type: params.firmware_type.unwrap_or(release.firmware_type),
        };

        let installer = self.installer();
        let task_release = release.clone();
        let value = self
            .tasks
            .run_with_retry(move || {
                let installer = installer.clone();
                let release = task_release.clone();
                let request = request.clone();
                async move { installer.install_all(&release, &request).await }
            })
            .await?;
        let versions: DeviceVersions =
            serde_json::from_value(value).map_err(|e| HardwareError::Decode(e.to_string()))?;

        self.finish(&release).await?;
        Ok(versions)
    }

    /// Settle, check preconditions and start a fresh task run
    async fn prepare(&self, params: &UpdateWorkflowParams) -> Result<()> {
        tokio::time::sleep(ms(self.config.settle_ms)).await;
        self.validator.validate_all(params, &self.dev.get())?;
        self.tasks.begin("start_update_workflow").await;
        Ok(())
    }

    async fn start_bootloader_task(
        &self,
        release: &Arc<ReleaseCheckResult>,
        params: &UpdateWorkflowParams,
    ) -> Result<()> {
        if release
            .update_infos
            .firmware
            .as_ref()
            .and_then(|f| f.to_version.as_ref())
            .is_none()
        {
            debug!("No firmware target, skipping bootloader phase");
            return Ok(());
        }

        // the bootloader target may have moved since the user confirmed
        let (handle_id, session) = self.installer().session_for(&release.connect_id).await?;
        let opts = StatusOptions {
            allow_empty_connect_id: true,
        };
        let features = self.gate.get_status_fresh(Some(&handle_id), &opts).await?;
        let descriptor = session
            .driver()
            .check_release(&handle_id, FirmwareComponent::Bootloader)
            .await?;
        let overrides = self.dev.overrides();
        let info = ComponentUpdateInfo::new(
            FirmwareComponent::Bootloader,
            &features,
            descriptor,
            &overrides,
        );
        if !info.has_upgrade && !overrides.force_update_bootloader {
            info!(connect_id = %release.connect_id, "Bootloader already up to date");
            return Ok(());
        }

        let request = InstallRequest {
            component: FirmwareComponent::Bootloader,
            target_version: info.to_version.clone(),
            platform: self.config.platform,
            firmware_type: params.firmware_type.unwrap_or(release.firmware_type),
            is_update_bootloader: true,
            forced_update_resource: false,
        };
        let installer = self.installer();
        let task_release = release.clone();
        self.tasks
            .run_with_retry(move || {
                let installer = installer.clone();
                let release = task_release.clone();
                let request = request.clone();
                async move { installer.install_bootloader(&release, &request).await }
            })
            .await?;
        Ok(())
    }

    async fn start_component_task(
        &self,
        release: &Arc<ReleaseCheckResult>,
        info: &ComponentUpdateInfo,
        params: &UpdateWorkflowParams,
    ) -> Result<()> {
        let request = InstallRequest {
            component: info.component,
            target_version: info.to_version.clone(),
            platform: self.config.platform,
            firmware_type: params.firmware_type.unwrap_or(release.firmware_type),
            is_update_bootloader: false,
            forced_update_resource: self.dev.get().force_update_res_even_same_version,
        };
        let installer = self.installer();
        let task_release = release.clone();
        self.tasks
            .run_with_retry(move || {
                let installer = installer.clone();
                let release = task_release.clone();
                let request = request.clone();
                async move { installer.install_component(&release, &request).await }
            })
            .await?;
        Ok(())
    }

    /// Refresh the registry from the updated device and report completion
    async fn finish(&self, release: &ReleaseCheckResult) -> Result<()> {
        self.tasks.set_retry(None);
        self.wait_reboot(RebootPhase::Done, release).await;

        if !release.connect_id.is_empty() {
            self.detect.reset(&release.connect_id);
            self.refresh_registry(&release.connect_id).await?;
        }
        self.dev.clear_once();

        info!(connect_id = %release.connect_id, "Update workflow finished");
        self.ui.publish(UiEvent::Workflow {
            connect_id: release.connect_id.clone(),
            state: WorkflowState::UpdateDone {
                release: Some(Box::new(release.clone())),
            },
        });
        Ok(())
    }

    async fn refresh_registry(&self, connect_id: &str) -> Result<()> {
        let Some(record) = self.registry.find_by_connect_id(connect_id).await? else {
            debug!(connect_id = %connect_id, "No stored device to refresh");
            return Ok(());
        };
        self.registry
            .set_force_recheck_firmware(&record.id, false)
            .await?;

        let opts = StatusOptions {
            allow_empty_connect_id: true,
        };
        match self.gate.get_status_fresh(Some(connect_id), &opts).await {
            Ok(features) => {
                self.registry
                    .update_cached_versions(&record.id, features.versions, features.firmware_type)
                    .await?;
            }
            Err(e) => {
                warn!(device = %record.id, error = %e, "Could not read versions after update")
            }
        }
        Ok(())
    }

    fn report<T>(&self, params: &UpdateWorkflowParams, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_cancellation() {
                info!(connect_id = %params.release.connect_id, reason = %e, "Update workflow stopped");
            } else {
                warn!(connect_id = %params.release.connect_id, error = %e, "Update workflow failed");
                self.ui.publish(UiEvent::Workflow {
                    connect_id: params.release.connect_id.clone(),
                    state: WorkflowState::Error {
                        reason: e.to_payload(),
                    },
                });
            }
        }
        result
    }

    async fn wait_next_phase(&self, release: &ReleaseCheckResult, reboot_pending: &mut bool) {
        if std::mem::take(reboot_pending) {
            self.wait_reboot(RebootPhase::NextPhase, release).await;
        }
    }

    async fn wait_reboot(&self, phase: RebootPhase, release: &ReleaseCheckResult) {
        let transport = self.settings.current_transport().await;
        let delay = reboot_delay(phase, release.device_type, transport, &self.config.reboot);
        if delay.is_zero() {
            return;
        }
        debug!(?phase, delay_ms = delay.as_millis() as u64, "Waiting for device reboot");
        tokio::time::sleep(delay).await;
    }

    fn installer(&self) -> PhaseInstaller {
        PhaseInstaller {
            session: self.session.clone(),
            identity: self.identity.clone(),
            ui: self.ui.clone(),
            verify_wait: ms(self.config.verify_wait_ms),
        }
    }
}
