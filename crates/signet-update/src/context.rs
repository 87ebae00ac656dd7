//! Owned wiring of every update component
//!
//! One [`HardwareContext`] per process. It holds the shared transport
//! state, the task queue and the detect throttle, so nothing here lives in
//! globals.

use signet_transport::{
    DeviceDriver, DeviceRegistry, EnvironmentProbe, FeatureGate, FeatureGateConfig,
    IdentityConfig, IdentityResolver, NegotiatorConfig, SessionConfig, SessionFacade,
    TransportNegotiator, TransportSettings, UiChannel,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::backend::ReleaseBackend;
use crate::config::{ms, Config};
use crate::detect::DetectThrottle;
use crate::dev_settings::DevSettingsStore;
use crate::release::ReleaseChecker;
use crate::tasks::{TaskQueueConfig, UpdateTaskQueue};
use crate::validate::UpdateValidator;
use crate::workflow::UpdateWorkflow;

pub struct HardwareContext {
    pub ui: UiChannel,
    pub session: Arc<SessionFacade>,
    pub gate: Arc<FeatureGate>,
    pub identity: Arc<IdentityResolver>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub dev: Arc<DevSettingsStore>,
    pub tasks: Arc<UpdateTaskQueue>,
    pub release: ReleaseChecker,
    pub workflow: UpdateWorkflow,
}

impl HardwareContext {
    pub fn new(
        config: &Config,
        driver: Arc<dyn DeviceDriver>,
        probe: Arc<dyn EnvironmentProbe>,
        registry: Arc<dyn DeviceRegistry>,
        settings: Arc<dyn TransportSettings>,
        backend: Arc<dyn ReleaseBackend>,
    ) -> Arc<Self> {
        let ui = UiChannel::new();
        let transport = &config.transport;

        let negotiator = Arc::new(TransportNegotiator::new(
            NegotiatorConfig {
                enable_desktop_bluetooth: transport.enable_desktop_bluetooth,
                ble_transport: transport.ble_transport,
                ..Default::default()
            },
            settings.clone(),
            probe,
            ui.clone(),
        ));
        let session = Arc::new(SessionFacade::new(
            driver.clone(),
            negotiator.clone(),
            settings.clone(),
            registry.clone(),
            ui.clone(),
            SessionConfig {
                strict_driver_versions: transport.strict_driver_versions,
                ..Default::default()
            },
        ));
        let gate = Arc::new(FeatureGate::new(
            driver.clone(),
            FeatureGateConfig {
                read_timeout: Duration::from_secs(transport.status_timeout_secs),
                memo_ttl: Duration::from_secs(transport.status_cache_ttl_secs),
                ..Default::default()
            },
        ));
        let identity = Arc::new(IdentityResolver::new(
            registry.clone(),
            negotiator,
            settings.clone(),
            driver,
            ui.clone(),
            IdentityConfig {
                pairing_timeout: Duration::from_secs(transport.pairing_timeout_secs),
                ..Default::default()
            },
        ));

        let update = &config.update;
        let dev = Arc::new(DevSettingsStore::new(config.dev.clone()));
        let detect = Arc::new(DetectThrottle::new(Duration::from_secs(
            update.detect_interval_secs,
        )));
        let tasks = Arc::new(UpdateTaskQueue::new(
            ui.clone(),
            gate.clone(),
            TaskQueueConfig {
                retry_delay: ms(update.reboot.retry_ms),
                retry_probe_timeout: ms(update.retry_probe_timeout_ms),
            },
        ));

        let release = ReleaseChecker::new(
            session.clone(),
            gate.clone(),
            identity.clone(),
            tasks.clone(),
            dev.clone(),
            backend,
            detect.clone(),
            ui.clone(),
            ms(update.cancel_settle_ms),
        );
        let workflow = UpdateWorkflow::new(
            session.clone(),
            gate.clone(),
            identity.clone(),
            registry.clone(),
            settings,
            tasks.clone(),
            dev.clone(),
            detect,
            UpdateValidator::new(config.validation.clone(), update.platform),
            ui.clone(),
            update.clone(),
        );

        info!(platform = ?update.platform, usb = %transport.usb_transport, "Hardware context ready");
        Arc::new(Self {
            ui,
            session,
            gate,
            identity,
            registry,
            dev,
            tasks,
            release,
            workflow,
        })
    }

    /// Stop the running workflow; pending phases are rejected
    pub async fn exit_update_workflow(&self) {
        self.tasks.exit().await;
    }
}
