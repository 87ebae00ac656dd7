//! Device driver boundary
//!
//! Everything that actually talks to the hardware goes through
//! [`DeviceDriver`]. The wire protocol lives behind it; this crate only
//! sequences, caches and gates the calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use signet_core::{
    DeviceVersions, FeatureSnapshot, FirmwareComponent, FirmwareType, ReleaseDescriptor, Result,
    TransportKind,
};
use tokio::sync::broadcast;

/// Options for a status read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOptions {
    /// Allow reading whichever device is attached when no connect id is known
    #[serde(default)]
    pub allow_empty_connect_id: bool,
}

/// Host platform the install is driven from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Desktop,
    Web,
    Native,
    Extension,
}

impl Default for Platform {
    fn default() -> Self {
        Self::Desktop
    }
}

/// Parameters for a single-component install
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub component: FirmwareComponent,
    pub target_version: Option<String>,
    pub platform: Platform,
    pub firmware_type: FirmwareType,
    /// Install the bootloader through the regular firmware path
    #[serde(default)]
    pub is_update_bootloader: bool,
    /// Also push the resource bundle alongside the firmware
    #[serde(default)]
    pub forced_update_resource: bool,
}

/// Targets for a single-shot install of every component at once
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallAllRequest {
    pub bootloader_version: Option<String>,
    pub firmware_version: Option<String>,
    pub ble_version: Option<String>,
    pub platform: Platform,
    pub firmware_type: FirmwareType,
}

/// A device found by a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchedDevice {
    pub connect_id: String,
    /// Advertised name
    pub name: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub transport: TransportKind,
}

/// Bluetooth availability as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BleState {
    Available,
    Unavailable,
    /// Permission was never requested
    NotDetermined,
    /// Permission was denied
    Unauthorized,
}

/// Outcome of asking the driver whether the bridge answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCheck {
    Reachable,
    TimedOut,
    /// The driver host itself failed before reaching the bridge
    HostError(String),
    Unreachable(String),
}

/// Undecoded event as emitted by the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDeviceEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawDeviceEvent {
    pub fn new(kind: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
        }
    }
}

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Versions of the composed driver libraries, by library name
    fn versions(&self) -> Vec<(String, String)>;

    async fn read_status(&self, connect_id: &str, opts: &StatusOptions) -> Result<FeatureSnapshot>;

    async fn check_release(
        &self,
        connect_id: &str,
        component: FirmwareComponent,
    ) -> Result<ReleaseDescriptor>;

    async fn reboot_to_bootloader(&self, connect_id: &str) -> Result<()>;

    async fn reboot_to_boardloader(&self, connect_id: &str) -> Result<()>;

    async fn install_firmware(&self, connect_id: &str, request: &InstallRequest) -> Result<()>;

    /// Dedicated bootloader update used by touchscreen families
    async fn update_bootloader(&self, connect_id: &str) -> Result<()>;

    /// Install every target in one call, returning the versions reported afterwards
    async fn install_all(
        &self,
        connect_id: &str,
        request: &InstallAllRequest,
    ) -> Result<DeviceVersions>;

    async fn cancel(&self, connect_id: Option<&str>) -> Result<()>;

    async fn switch_transport(&self, kind: TransportKind) -> Result<()>;

    /// Drop the current communication handle
    async fn reset(&self) -> Result<()>;

    async fn check_bridge_reachable(&self) -> BridgeCheck;

    async fn search_devices(&self) -> Result<Vec<SearchedDevice>>;

    /// Connect to a scanned device and read its status
    async fn connect(&self, connect_id: &str) -> Result<FeatureSnapshot>;

    /// Number of attached devices matching the direct USB filter
    async fn usb_device_count(&self) -> Result<usize>;

    async fn bluetooth_state(&self) -> BleState;

    async fn request_bluetooth_permission(&self) -> BleState;

    fn subscribe(&self) -> broadcast::Receiver<RawDeviceEvent>;
}
