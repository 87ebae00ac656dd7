//! Transport negotiation
//!
//! Decides which transport a call should use. The decision order is:
//! 1. forced override (onboarding), never cached
//! 2. compact device family that only works through USB
//! 3. non-interactive contexts reuse the persisted setting
//! 4. live detection: USB, then Bluetooth, then the USB setting
//!
//! Detected decisions are cached per context for a short time and dropped
//! whenever the transport actually changes.

use async_trait::async_trait;
use signet_core::{CallContext, Result, TransportKind, TtlCache};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::bridge::BridgeClient;
use crate::driver::{BleState, DeviceDriver};
use crate::events::DialogKind;
use crate::settings::TransportSettings;
use crate::ui::{UiChannel, UiEvent};

/// Connect id prefix of the compact family
const MINI_CONNECT_ID_PREFIX: &str = "MI";

/// Live detection of the host environment
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// A device is reachable over the given USB flavour
    async fn usb_available(&self, usb: TransportKind) -> bool;

    async fn ble_state(&self) -> BleState;

    async fn request_ble_permission(&self) -> BleState;
}

/// Probe backed by the bridge HTTP endpoint and the driver
pub struct HostEnvironment {
    bridge: BridgeClient,
    driver: Arc<dyn DeviceDriver>,
}

impl HostEnvironment {
    pub fn new(bridge: BridgeClient, driver: Arc<dyn DeviceDriver>) -> Self {
        Self { bridge, driver }
    }
}

#[async_trait]
impl EnvironmentProbe for HostEnvironment {
    async fn usb_available(&self, usb: TransportKind) -> bool {
        match usb {
            TransportKind::Bridge => self.bridge.has_devices().await,
            _ => self.driver.usb_device_count().await.unwrap_or(0) > 0,
        }
    }

    async fn ble_state(&self) -> BleState {
        self.driver.bluetooth_state().await
    }

    async fn request_ble_permission(&self) -> BleState {
        self.driver.request_bluetooth_permission().await
    }
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Desktop Bluetooth is opt-in
    pub enable_desktop_bluetooth: bool,
    /// Bluetooth transport of this host
    pub ble_transport: TransportKind,
    pub decision_ttl: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            enable_desktop_bluetooth: false,
            ble_transport: TransportKind::DesktopWebBle,
            decision_ttl: Duration::from_secs(2),
        }
    }
}

pub struct TransportNegotiator {
    config: NegotiatorConfig,
    settings: Arc<dyn TransportSettings>,
    probe: Arc<dyn EnvironmentProbe>,
    ui: UiChannel,
    force_transport: RwLock<Option<TransportKind>>,
    decisions: Mutex<TtlCache<CallContext, TransportKind>>,
    /// Single-flight guard over lookup, detection and insert
    detecting: Mutex<()>,
    requesting_permission: AtomicBool,
}

impl TransportNegotiator {
    pub fn new(
        config: NegotiatorConfig,
        settings: Arc<dyn TransportSettings>,
        probe: Arc<dyn EnvironmentProbe>,
        ui: UiChannel,
    ) -> Self {
        let decisions = TtlCache::new(config.decision_ttl, 1);
        Self {
            config,
            settings,
            probe,
            ui,
            force_transport: RwLock::new(None),
            decisions: Mutex::new(decisions),
            detecting: Mutex::new(()),
            requesting_permission: AtomicBool::new(false),
        }
    }

    /// Pick the transport for a call
    pub async fn determine_transport(
        &self,
        context: CallContext,
        connect_id: Option<&str>,
    ) -> TransportKind {
        if let Some(forced) = *self.force_transport.read().await {
            debug!(transport = %forced, "Using forced transport");
            return forced;
        }

        if connect_id.is_some_and(|id| id.starts_with(MINI_CONNECT_ID_PREFIX)) {
            return self.usb_fallback().await;
        }

        if context.skips_detection() {
            return self.settings.current_transport().await;
        }

        let _detecting = self.detecting.lock().await;
        if let Some(cached) = self.decisions.lock().await.get(&context) {
            return cached;
        }

        let decided = self.detect(context).await;
        self.decisions.lock().await.insert(context, decided);
        debug!(?context, transport = %decided, "Transport detected");
        decided
    }

    async fn detect(&self, context: CallContext) -> TransportKind {
        let usb = self.usb_fallback().await;
        if self.probe.usb_available(usb).await {
            return usb;
        }
        if self.ble_available(context).await {
            return self.config.ble_transport;
        }
        usb
    }

    async fn usb_fallback(&self) -> TransportKind {
        match self.settings.usb_transport().await {
            TransportKind::WebUsb => TransportKind::WebUsb,
            _ => TransportKind::Bridge,
        }
    }

    async fn ble_available(&self, context: CallContext) -> bool {
        if !self.config.enable_desktop_bluetooth {
            return false;
        }
        match self.probe.ble_state().await {
            BleState::Available => true,
            BleState::Unavailable => false,
            BleState::NotDetermined => self.request_permission_once().await,
            BleState::Unauthorized => {
                if context != CallContext::UserInteractionNoBleDialog {
                    self.ui.publish(UiEvent::Dialog {
                        dialog: DialogKind::BluetoothPermission,
                    });
                }
                false
            }
        }
    }

    /// Only one permission prompt may be in flight; concurrent callers skip Bluetooth
    async fn request_permission_once(&self) -> bool {
        if self
            .requesting_permission
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Bluetooth permission request already in flight");
            return false;
        }
        let state = self.probe.request_ble_permission().await;
        self.requesting_permission.store(false, Ordering::Release);
        state == BleState::Available
    }

    /// Persist the active transport; the decision cache is dropped only on change.
    /// Returns whether the transport changed.
    pub async fn set_current_transport(&self, kind: TransportKind) -> Result<bool> {
        let current = self.settings.current_transport().await;
        if current == kind {
            return Ok(false);
        }
        self.settings.set_current_transport(kind).await?;
        self.invalidate().await;
        info!(from = %current, to = %kind, "Transport changed");
        Ok(true)
    }

    pub async fn set_force_transport(&self, kind: Option<TransportKind>) {
        *self.force_transport.write().await = kind;
        self.invalidate().await;
        info!(transport = ?kind, "Forced transport updated");
    }

    pub async fn clear_force_transport(&self) {
        self.set_force_transport(None).await;
    }

    pub async fn force_transport(&self) -> Option<TransportKind> {
        *self.force_transport.read().await
    }

    pub async fn invalidate(&self) {
        self.decisions.lock().await.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::InMemoryTransportSettings;
    use std::sync::atomic::AtomicUsize;

    struct StaticProbe {
        usb: AtomicBool,
        ble: std::sync::Mutex<BleState>,
        permission_result: BleState,
        usb_calls: AtomicUsize,
        permission_calls: AtomicUsize,
    }

    impl StaticProbe {
        fn new(usb: bool, ble: BleState) -> Arc<Self> {
            Arc::new(Self {
                usb: AtomicBool::new(usb),
                ble: std::sync::Mutex::new(ble),
                permission_result: BleState::Available,
                usb_calls: AtomicUsize::new(0),
                permission_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EnvironmentProbe for StaticProbe {
        async fn usb_available(&self, _usb: TransportKind) -> bool {
            self.usb_calls.fetch_add(1, Ordering::SeqCst);
            self.usb.load(Ordering::SeqCst)
        }

        async fn ble_state(&self) -> BleState {
            *self.ble.lock().unwrap()
        }

        async fn request_ble_permission(&self) -> BleState {
            self.permission_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.permission_result
        }
    }

    fn make_negotiator(probe: Arc<StaticProbe>, ble: bool) -> (TransportNegotiator, UiChannel) {
        let ui = UiChannel::new();
        let config = NegotiatorConfig {
            enable_desktop_bluetooth: ble,
            ..Default::default()
        };
        let negotiator = TransportNegotiator::new(
            config,
            Arc::new(InMemoryTransportSettings::default()),
            probe,
            ui.clone(),
        );
        (negotiator, ui)
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_transport_bypasses_cache() {
        let probe = StaticProbe::new(true, BleState::Available);
        let (negotiator, _) = make_negotiator(probe, true);

        let first = negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(first, TransportKind::Bridge);

        negotiator
            .set_force_transport(Some(TransportKind::DesktopWebBle))
            .await;
        let forced = negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(forced, TransportKind::DesktopWebBle);

        // the override is not cached: clearing it re-detects
        negotiator.clear_force_transport().await;
        let after = negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(after, TransportKind::Bridge);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_cached_for_ttl() {
        let probe = StaticProbe::new(true, BleState::Unavailable);
        let (negotiator, _) = make_negotiator(probe.clone(), false);

        negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(probe.usb_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(2100)).await;
        negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(probe.usb_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_contexts_skip_detection() {
        let probe = StaticProbe::new(false, BleState::NotDetermined);
        let (negotiator, _) = make_negotiator(probe.clone(), true);

        for context in [
            CallContext::BackgroundTask,
            CallContext::SdkInitialization,
            CallContext::SilentCall,
        ] {
            let kind = negotiator.determine_transport(context, None).await;
            assert_eq!(kind, TransportKind::Bridge);
        }
        assert_eq!(probe.usb_calls.load(Ordering::SeqCst), 0);
        assert_eq!(probe.permission_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mini_family_stays_on_usb() {
        let probe = StaticProbe::new(false, BleState::Available);
        let (negotiator, _) = make_negotiator(probe.clone(), true);
        let kind = negotiator
            .determine_transport(CallContext::UserInteraction, Some("MI2025"))
            .await;
        assert_eq!(kind, TransportKind::Bridge);
        assert_eq!(probe.usb_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_when_no_usb() {
        let probe = StaticProbe::new(false, BleState::Available);
        let (negotiator, _) = make_negotiator(probe, true);
        let kind = negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(kind, TransportKind::DesktopWebBle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_disabled_falls_back_to_usb_setting() {
        let probe = StaticProbe::new(false, BleState::Available);
        let (negotiator, _) = make_negotiator(probe, false);
        let kind = negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(kind, TransportKind::Bridge);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_permission_prompt_in_flight() {
        let probe = StaticProbe::new(false, BleState::NotDetermined);
        let (negotiator, _) = make_negotiator(probe.clone(), true);

        let (a, b) = tokio::join!(
            negotiator.ble_available(CallContext::UserInteraction),
            negotiator.ble_available(CallContext::UpdateFirmware),
        );
        assert_eq!(probe.permission_calls.load(Ordering::SeqCst), 1);
        assert!(a ^ b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_detection() {
        let probe = StaticProbe::new(false, BleState::NotDetermined);
        let (negotiator, _) = make_negotiator(probe.clone(), true);

        let (a, b) = tokio::join!(
            negotiator.determine_transport(CallContext::UserInteraction, None),
            negotiator.determine_transport(CallContext::UserInteraction, None),
        );
        assert_eq!(a, TransportKind::DesktopWebBle);
        assert_eq!(a, b);
        assert_eq!(probe.usb_calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.permission_calls.load(Ordering::SeqCst), 1);

        let cached = negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(cached, a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_dialog_suppressed_by_context() {
        let probe = StaticProbe::new(false, BleState::Unauthorized);
        let (negotiator, ui) = make_negotiator(probe, true);
        let mut rx = ui.subscribe();

        negotiator
            .determine_transport(CallContext::UserInteractionNoBleDialog, None)
            .await;
        assert!(rx.try_recv().is_err());

        negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert!(matches!(
            rx.try_recv(),
            Ok(UiEvent::Dialog {
                dialog: DialogKind::BluetoothPermission
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_dropped_only_on_change() {
        let probe = StaticProbe::new(true, BleState::Unavailable);
        let (negotiator, _) = make_negotiator(probe.clone(), false);

        negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert!(!negotiator
            .set_current_transport(TransportKind::Bridge)
            .await
            .unwrap());
        negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(probe.usb_calls.load(Ordering::SeqCst), 1);

        assert!(negotiator
            .set_current_transport(TransportKind::WebUsb)
            .await
            .unwrap());
        negotiator
            .determine_transport(CallContext::UserInteraction, None)
            .await;
        assert_eq!(probe.usb_calls.load(Ordering::SeqCst), 2);
    }
}
