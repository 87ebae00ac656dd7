//! Scriptable in-memory driver for tests

use async_trait::async_trait;
use signet_core::{
    DeviceType, DeviceVersions, FeatureSnapshot, FirmwareComponent, HardwareError,
    ReleaseDescriptor, Result, TransportKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::driver::{
    BleState, BridgeCheck, DeviceDriver, InstallAllRequest, InstallRequest, RawDeviceEvent,
    SearchedDevice, StatusOptions,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct FakeDriver {
    pub read_calls: AtomicUsize,
    pub max_concurrent_reads: AtomicUsize,
    in_flight: AtomicUsize,
    read_delay: Mutex<Duration>,
    snapshot: Mutex<FeatureSnapshot>,
    releases: Mutex<HashMap<FirmwareComponent, ReleaseDescriptor>>,
    versions: Mutex<Vec<(String, String)>>,
    bridge: Mutex<BridgeCheck>,
    searched: Mutex<Vec<SearchedDevice>>,
    connected: Mutex<HashMap<String, FeatureSnapshot>>,
    failing_installs: AtomicUsize,
    install_all_result: Mutex<Option<DeviceVersions>>,
    usb_devices: AtomicUsize,
    ble_state: Mutex<BleState>,
    calls: Mutex<Vec<String>>,
    event_tx: broadcast::Sender<RawDeviceEvent>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(100);
        Arc::new(Self {
            read_calls: AtomicUsize::new(0),
            max_concurrent_reads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            read_delay: Mutex::new(Duration::ZERO),
            snapshot: Mutex::new(Self::default_snapshot()),
            releases: Mutex::new(HashMap::new()),
            versions: Mutex::new(vec![
                ("core".to_string(), "1.0.0".to_string()),
                ("transport".to_string(), "1.0.0".to_string()),
            ]),
            bridge: Mutex::new(BridgeCheck::Reachable),
            searched: Mutex::new(Vec::new()),
            connected: Mutex::new(HashMap::new()),
            failing_installs: AtomicUsize::new(0),
            install_all_result: Mutex::new(None),
            usb_devices: AtomicUsize::new(1),
            ble_state: Mutex::new(BleState::Unavailable),
            calls: Mutex::new(Vec::new()),
            event_tx,
        })
    }

    pub fn default_snapshot() -> FeatureSnapshot {
        FeatureSnapshot {
            device_id: Some("SERIAL-1".to_string()),
            device_type: DeviceType::Pro,
            initialized: true,
            firmware_present: true,
            versions: DeviceVersions {
                bootloader: "2.5.0".to_string(),
                firmware: "4.0.0".to_string(),
                ble: "2.1.0".to_string(),
            },
            battery_level: Some(80),
            ble_name: Some("Signet Pro 1A2B".to_string()),
            ..Default::default()
        }
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *lock(&self.read_delay) = delay;
    }

    pub fn set_snapshot(&self, snapshot: FeatureSnapshot) {
        *lock(&self.snapshot) = snapshot;
    }

    pub fn snapshot(&self) -> FeatureSnapshot {
        lock(&self.snapshot).clone()
    }

    pub fn set_release(&self, component: FirmwareComponent, release: ReleaseDescriptor) {
        lock(&self.releases).insert(component, release);
    }

    pub fn set_versions(&self, versions: Vec<(&str, &str)>) {
        *lock(&self.versions) = versions
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
    }

    pub fn set_bridge(&self, check: BridgeCheck) {
        *lock(&self.bridge) = check;
    }

    pub fn add_searched(&self, device: SearchedDevice, features: FeatureSnapshot) {
        lock(&self.connected).insert(device.connect_id.clone(), features);
        lock(&self.searched).push(device);
    }

    /// Fail the next `n` install calls with a flash error
    pub fn fail_next_installs(&self, n: usize) {
        self.failing_installs.store(n, Ordering::SeqCst);
    }

    pub fn set_install_all_result(&self, versions: DeviceVersions) {
        *lock(&self.install_all_result) = Some(versions);
    }

    pub fn set_usb_devices(&self, count: usize) {
        self.usb_devices.store(count, Ordering::SeqCst);
    }

    pub fn set_ble_state(&self, state: BleState) {
        *lock(&self.ble_state) = state;
    }

    pub fn emit(&self, event: RawDeviceEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn take_install_failure(&self, component: FirmwareComponent) -> Result<()> {
        let remaining = self.failing_installs.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_installs.store(remaining - 1, Ordering::SeqCst);
            return Err(HardwareError::Flash {
                component,
                message: "write failed".to_string(),
            });
        }
        Ok(())
    }

    fn apply_version(&self, component: FirmwareComponent, version: Option<&str>) {
        let Some(version) = version else { return };
        let mut snapshot = lock(&self.snapshot);
        match component {
            FirmwareComponent::Bootloader => snapshot.versions.bootloader = version.to_string(),
            FirmwareComponent::Firmware => snapshot.versions.firmware = version.to_string(),
            FirmwareComponent::Ble => snapshot.versions.ble = version.to_string(),
            FirmwareComponent::Bridge => {}
        }
    }
}

#[async_trait]
impl DeviceDriver for FakeDriver {
    fn versions(&self) -> Vec<(String, String)> {
        lock(&self.versions).clone()
    }

    async fn read_status(&self, connect_id: &str, _opts: &StatusOptions) -> Result<FeatureSnapshot> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_reads.fetch_max(now, Ordering::SeqCst);
        self.record(format!("read_status:{}", connect_id));

        let delay = *lock(&self.read_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.snapshot())
    }

    async fn check_release(
        &self,
        _connect_id: &str,
        component: FirmwareComponent,
    ) -> Result<ReleaseDescriptor> {
        self.record(format!("check_release:{}", component));
        Ok(lock(&self.releases)
            .get(&component)
            .cloned()
            .unwrap_or_default())
    }

    async fn reboot_to_bootloader(&self, connect_id: &str) -> Result<()> {
        self.record(format!("reboot_to_bootloader:{}", connect_id));
        Ok(())
    }

    async fn reboot_to_boardloader(&self, connect_id: &str) -> Result<()> {
        self.record(format!("reboot_to_boardloader:{}", connect_id));
        Ok(())
    }

    async fn install_firmware(&self, _connect_id: &str, request: &InstallRequest) -> Result<()> {
        self.record(format!(
            "install_firmware:{}{}",
            request.component,
            if request.is_update_bootloader { ":bootloader_path" } else { "" }
        ));
        self.take_install_failure(request.component)?;
        self.apply_version(request.component, request.target_version.as_deref());
        Ok(())
    }

    async fn update_bootloader(&self, _connect_id: &str) -> Result<()> {
        self.record("update_bootloader".to_string());
        self.take_install_failure(FirmwareComponent::Bootloader)
    }

    async fn install_all(
        &self,
        _connect_id: &str,
        request: &InstallAllRequest,
    ) -> Result<DeviceVersions> {
        self.record("install_all".to_string());
        self.take_install_failure(FirmwareComponent::Firmware)?;
        if let Some(versions) = lock(&self.install_all_result).clone() {
            return Ok(versions);
        }
        Ok(DeviceVersions {
            bootloader: request.bootloader_version.clone().unwrap_or_default(),
            firmware: request.firmware_version.clone().unwrap_or_default(),
            ble: request.ble_version.clone().unwrap_or_default(),
        })
    }

    async fn cancel(&self, connect_id: Option<&str>) -> Result<()> {
        self.record(format!("cancel:{}", connect_id.unwrap_or("")));
        Ok(())
    }

    async fn switch_transport(&self, kind: TransportKind) -> Result<()> {
        self.record(format!("switch_transport:{}", kind));
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.record("reset".to_string());
        Ok(())
    }

    async fn check_bridge_reachable(&self) -> BridgeCheck {
        self.record("check_bridge".to_string());
        lock(&self.bridge).clone()
    }

    async fn search_devices(&self) -> Result<Vec<SearchedDevice>> {
        self.record("search_devices".to_string());
        Ok(lock(&self.searched).clone())
    }

    async fn connect(&self, connect_id: &str) -> Result<FeatureSnapshot> {
        self.record(format!("connect:{}", connect_id));
        lock(&self.connected)
            .get(connect_id)
            .cloned()
            .ok_or(HardwareError::DeviceNotFound)
    }

    async fn usb_device_count(&self) -> Result<usize> {
        Ok(self.usb_devices.load(Ordering::SeqCst))
    }

    async fn bluetooth_state(&self) -> BleState {
        *lock(&self.ble_state)
    }

    async fn request_bluetooth_permission(&self) -> BleState {
        *lock(&self.ble_state)
    }

    fn subscribe(&self) -> broadcast::Receiver<RawDeviceEvent> {
        self.event_tx.subscribe()
    }
}
