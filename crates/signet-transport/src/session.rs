//! Session facade over the device driver
//!
//! Hands out a ready-to-use driver handle for the negotiated transport.
//! The facade owns three pieces of once-per-process state: which transport
//! the handle was built for, whether driver events are wired, and whether
//! the bridge has been probed.

use serde::{Deserialize, Serialize};
use signet_core::{CallContext, HardwareError, Result, TransportKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::driver::{BridgeCheck, DeviceDriver};
use crate::events::DeviceEvent;
use crate::negotiator::TransportNegotiator;
use crate::registry::DeviceRegistry;
use crate::settings::TransportSettings;
use crate::ui::{UiChannel, UiEvent};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reject mismatched driver library versions (development builds)
    pub strict_driver_versions: bool,
    pub cancel_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strict_driver_versions: cfg!(debug_assertions),
            cancel_debounce: Duration::from_millis(100),
        }
    }
}

/// Driver handle bound to a transport
#[derive(Clone)]
pub struct SessionHandle {
    pub transport: TransportKind,
    driver: Arc<dyn DeviceDriver>,
}

impl SessionHandle {
    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }
}

/// Bridge reachability as reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub status: bool,
    #[serde(default)]
    pub timeout: bool,
}

pub struct SessionFacade {
    driver: Arc<dyn DeviceDriver>,
    negotiator: Arc<TransportNegotiator>,
    settings: Arc<dyn TransportSettings>,
    registry: Arc<dyn DeviceRegistry>,
    ui: UiChannel,
    config: SessionConfig,
    active: RwLock<Option<TransportKind>>,
    events_registered: AtomicBool,
    bridge_checked: AtomicBool,
    cancel_generation: AtomicU64,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionFacade {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        negotiator: Arc<TransportNegotiator>,
        settings: Arc<dyn TransportSettings>,
        registry: Arc<dyn DeviceRegistry>,
        ui: UiChannel,
        config: SessionConfig,
    ) -> Self {
        Self {
            driver,
            negotiator,
            settings,
            registry,
            ui,
            config,
            active: RwLock::new(None),
            events_registered: AtomicBool::new(false),
            bridge_checked: AtomicBool::new(false),
            cancel_generation: AtomicU64::new(0),
            event_task: Mutex::new(None),
        }
    }

    pub fn negotiator(&self) -> &Arc<TransportNegotiator> {
        &self.negotiator
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub async fn active_transport(&self) -> Option<TransportKind> {
        *self.active.read().await
    }

    /// Ready driver handle for a call
    pub async fn get_session(
        &self,
        connect_id: Option<&str>,
        context: CallContext,
    ) -> Result<SessionHandle> {
        self.check_driver_versions()?;

        let transport = self.negotiator.determine_transport(context, connect_id).await;
        {
            let mut active = self.active.write().await;
            if *active != Some(transport) {
                if let Some(previous) = *active {
                    info!(from = %previous, to = %transport, "Recreating driver session");
                    self.driver.reset().await?;
                    self.unregister_events().await;
                }
                self.driver.switch_transport(transport).await?;
                *active = Some(transport);
            }
        }
        self.negotiator.set_current_transport(transport).await?;

        self.check_bridge_and_fallback().await;
        self.register_events().await;

        let transport = self.active_transport().await.unwrap_or(transport);
        Ok(SessionHandle {
            transport,
            driver: self.driver.clone(),
        })
    }

    fn check_driver_versions(&self) -> Result<()> {
        if !self.config.strict_driver_versions {
            return Ok(());
        }
        let versions = self.driver.versions();
        let Some((_, first)) = versions.first() else {
            return Ok(());
        };
        if versions.iter().any(|(_, v)| v != first) {
            let detail = versions
                .iter()
                .map(|(name, v)| format!("{}={}", name, v))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(HardwareError::DriverMismatch(detail));
        }
        Ok(())
    }

    /// Probe the bridge once per process; on failure switch to direct USB
    async fn check_bridge_and_fallback(&self) {
        if self.active_transport().await != Some(TransportKind::Bridge) {
            return;
        }
        if self.bridge_checked.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.driver.check_bridge_reachable().await {
            BridgeCheck::Reachable => debug!("Bridge reachable"),
            outcome => {
                warn!(?outcome, "Bridge not reachable, falling back to direct USB");
                if let Err(e) = self.fallback_to_webusb().await {
                    warn!(error = %e, "Direct USB fallback failed");
                }
            }
        }
    }

    async fn fallback_to_webusb(&self) -> Result<()> {
        self.driver.switch_transport(TransportKind::WebUsb).await?;
        *self.active.write().await = Some(TransportKind::WebUsb);
        self.settings.set_usb_transport(TransportKind::WebUsb).await?;
        self.negotiator
            .set_current_transport(TransportKind::WebUsb)
            .await?;
        Ok(())
    }

    /// Bridge status for the host UI
    pub async fn check_bridge_status(&self) -> BridgeStatus {
        match self.driver.check_bridge_reachable().await {
            BridgeCheck::Reachable | BridgeCheck::HostError(_) => BridgeStatus {
                status: true,
                timeout: false,
            },
            BridgeCheck::TimedOut => BridgeStatus {
                status: true,
                timeout: true,
            },
            BridgeCheck::Unreachable(_) => BridgeStatus {
                status: false,
                timeout: false,
            },
        }
    }

    /// Cancel the in-flight device call. Bursts collapse into the last call.
    pub async fn cancel(&self, connect_id: Option<&str>) -> Result<()> {
        let generation = self.cancel_generation.fetch_add(1, Ordering::AcqRel) + 1;
        tokio::time::sleep(self.config.cancel_debounce).await;
        if self.cancel_generation.load(Ordering::Acquire) != generation {
            debug!("Cancel superseded");
            return Ok(());
        }
        let session = self.get_session(connect_id, CallContext::SilentCall).await?;
        session.driver().cancel(connect_id).await
    }

    async fn register_events(&self) {
        if self.events_registered.swap(true, Ordering::AcqRel) {
            return;
        }
        let rx = self.driver.subscribe();
        let ui = self.ui.clone();
        let registry = self.registry.clone();
        let handle = tokio::spawn(forward_events(rx, ui, registry));
        *self.event_task.lock().await = Some(handle);
        debug!("Driver events registered");
    }

    async fn unregister_events(&self) {
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
        }
        self.events_registered.store(false, Ordering::Release);
    }

    pub fn events_registered(&self) -> bool {
        self.events_registered.load(Ordering::Acquire)
    }
}

async fn forward_events(
    mut rx: broadcast::Receiver<crate::driver::RawDeviceEvent>,
    ui: UiChannel,
    registry: Arc<dyn DeviceRegistry>,
) {
    loop {
        let raw = match rx.recv().await {
            Ok(raw) => raw,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Driver event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match DeviceEvent::decode(&raw) {
            Ok(event) => route_event(event, &ui, registry.as_ref()).await,
            Err(e) => warn!(error = %e, "Dropping undecodable driver event"),
        }
    }
}

async fn route_event(event: DeviceEvent, ui: &UiChannel, registry: &dyn DeviceRegistry) {
    match event {
        DeviceEvent::RequestPin { connect_id } => {
            ui.publish(UiEvent::EnterPinOnDevice { connect_id })
        }
        DeviceEvent::RequestPassphrase { connect_id } => {
            ui.publish(UiEvent::RequestPassphrase { connect_id })
        }
        DeviceEvent::FirmwareTip { message } => ui.publish(UiEvent::FirmwareTip { message }),
        DeviceEvent::FirmwareProgress {
            progress,
            progress_type,
        } => ui.publish(UiEvent::FirmwareProgress {
            progress,
            progress_type,
        }),
        DeviceEvent::Dialog(dialog) => ui.publish(UiEvent::Dialog { dialog }),
        DeviceEvent::SupportFeatures {
            connect_id,
            features,
        } => {
            if let Err(e) = registry.update_features(&connect_id, features).await {
                warn!(connect_id = %connect_id, error = %e, "Failed to store features");
            }
        }
        DeviceEvent::ReleaseInfo { ble, .. } => debug!(ble, "Release info event"),
        DeviceEvent::Log { message } => debug!(target: "signet::driver", "{}", message),
        DeviceEvent::Skipped(kind) => debug!(?kind, "Skipping driver window event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RawDeviceEvent;
    use crate::negotiator::{EnvironmentProbe, NegotiatorConfig};
    use crate::registry::InMemoryDeviceRegistry;
    use crate::settings::InMemoryTransportSettings;
    use crate::testing::FakeDriver;
    use crate::driver::BleState;
    use async_trait::async_trait;
    use serde_json::json;

    struct UsbOnly;

    #[async_trait]
    impl EnvironmentProbe for UsbOnly {
        async fn usb_available(&self, _usb: TransportKind) -> bool {
            true
        }
        async fn ble_state(&self) -> BleState {
            BleState::Unavailable
        }
        async fn request_ble_permission(&self) -> BleState {
            BleState::Unavailable
        }
    }

    struct Fixture {
        driver: Arc<FakeDriver>,
        settings: Arc<InMemoryTransportSettings>,
        ui: UiChannel,
        facade: SessionFacade,
    }

    fn make_facade(strict: bool) -> Fixture {
        let driver = FakeDriver::new();
        let settings = Arc::new(InMemoryTransportSettings::default());
        let ui = UiChannel::new();
        let negotiator = Arc::new(TransportNegotiator::new(
            NegotiatorConfig::default(),
            settings.clone(),
            Arc::new(UsbOnly),
            ui.clone(),
        ));
        let facade = SessionFacade::new(
            driver.clone(),
            negotiator,
            settings.clone(),
            Arc::new(InMemoryDeviceRegistry::new()),
            ui.clone(),
            SessionConfig {
                strict_driver_versions: strict,
                cancel_debounce: Duration::from_millis(100),
            },
        );
        Fixture {
            driver,
            settings,
            ui,
            facade,
        }
    }

    #[tokio::test]
    async fn test_driver_mismatch_in_strict_mode() {
        let f = make_facade(true);
        f.driver
            .set_versions(vec![("core", "1.0.0"), ("transport", "1.0.1")]);
        let err = f
            .facade
            .get_session(Some("usb-1"), CallContext::UserInteraction)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HardwareError::DriverMismatch(_)));

        let relaxed = make_facade(false);
        relaxed
            .driver
            .set_versions(vec![("core", "1.0.0"), ("transport", "1.0.1")]);
        assert!(relaxed
            .facade
            .get_session(Some("usb-1"), CallContext::UserInteraction)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_bridge_falls_back_without_error() {
        let f = make_facade(false);
        f.driver
            .set_bridge(BridgeCheck::Unreachable("connection refused".to_string()));

        let session = f
            .facade
            .get_session(Some("usb-1"), CallContext::UserInteraction)
            .await
            .unwrap();
        assert_eq!(session.transport, TransportKind::WebUsb);
        assert_eq!(f.settings.usb_transport().await, TransportKind::WebUsb);
        assert_eq!(f.settings.current_transport().await, TransportKind::WebUsb);

        // probed only once per process
        f.facade
            .get_session(Some("usb-1"), CallContext::UserInteraction)
            .await
            .unwrap();
        assert_eq!(f.driver.count_calls("check_bridge"), 1);
    }

    #[tokio::test]
    async fn test_events_registered_once() {
        let f = make_facade(false);
        for _ in 0..3 {
            f.facade
                .get_session(Some("usb-1"), CallContext::UserInteraction)
                .await
                .unwrap();
        }
        assert!(f.facade.events_registered());
        assert_eq!(f.driver.count_calls("switch_transport"), 1);
        assert_eq!(f.driver.count_calls("reset"), 0);
    }

    #[tokio::test]
    async fn test_transport_change_recreates_handle() {
        let f = make_facade(false);
        f.facade
            .get_session(Some("usb-1"), CallContext::UserInteraction)
            .await
            .unwrap();
        f.facade
            .negotiator()
            .set_force_transport(Some(TransportKind::DesktopWebBle))
            .await;
        let session = f
            .facade
            .get_session(Some("usb-1"), CallContext::UserInteraction)
            .await
            .unwrap();
        assert_eq!(session.transport, TransportKind::DesktopWebBle);
        assert_eq!(f.driver.count_calls("reset"), 1);
        assert!(f.facade.events_registered());
    }

    #[tokio::test]
    async fn test_events_routed_and_skipped() {
        let f = make_facade(false);
        let mut rx = f.ui.subscribe();
        f.facade
            .get_session(Some("usb-1"), CallContext::UserInteraction)
            .await
            .unwrap();

        f.driver
            .emit(RawDeviceEvent::new("close_ui_window", json!(null)));
        f.driver.emit(RawDeviceEvent::new("not_an_event", json!({})));
        f.driver.emit(RawDeviceEvent::new(
            "firmware_tip",
            json!({"message": "ConfirmOnDevice"}),
        ));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, UiEvent::FirmwareTip { ref message } if message == "ConfirmOnDevice"));
    }

    #[tokio::test]
    async fn test_bridge_status_mapping() {
        let f = make_facade(false);
        f.driver.set_bridge(BridgeCheck::TimedOut);
        assert_eq!(
            f.facade.check_bridge_status().await,
            BridgeStatus {
                status: true,
                timeout: true
            }
        );
        f.driver
            .set_bridge(BridgeCheck::HostError("frame not loaded".to_string()));
        assert!(f.facade.check_bridge_status().await.status);
        f.driver
            .set_bridge(BridgeCheck::Unreachable("refused".to_string()));
        assert!(!f.facade.check_bridge_status().await.status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_debounced() {
        let f = make_facade(false);
        let (a, b, c) = tokio::join!(
            f.facade.cancel(Some("usb-1")),
            f.facade.cancel(Some("usb-1")),
            f.facade.cancel(Some("usb-1")),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(f.driver.count_calls("cancel"), 1);
    }
}
