//! Device types for tracking known signing hardware

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::firmware::FirmwareComponent;

/// Stable identifier for a device record, assigned once by the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Classic,
    Classic1s,
    ClassicPure,
    Mini,
    Touch,
    Pro,
    Unknown,
}

impl Default for DeviceType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl DeviceType {
    /// Touchscreen families reboot slower and use a dedicated bootloader update
    pub fn is_touch_family(&self) -> bool {
        matches!(self, DeviceType::Touch | DeviceType::Pro)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Classic => "classic",
            DeviceType::Classic1s => "classic1s",
            DeviceType::ClassicPure => "classic_pure",
            DeviceType::Mini => "mini",
            DeviceType::Touch => "touch",
            DeviceType::Pro => "pro",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode reported by a status read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    Normal,
    Bootloader,
    NotInitialized,
    BackupMode,
}

impl Default for DeviceMode {
    fn default() -> Self {
        Self::Normal
    }
}

/// Firmware flavour running on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareType {
    Universal,
    BitcoinOnly,
}

impl Default for FirmwareType {
    fn default() -> Self {
        Self::Universal
    }
}

/// Installed versions per component, empty string when unknown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceVersions {
    #[serde(default)]
    pub bootloader: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub ble: String,
}

impl DeviceVersions {
    /// Version for a component, `None` when not reported
    pub fn get(&self, component: FirmwareComponent) -> Option<&str> {
        let v = match component {
            FirmwareComponent::Bootloader => &self.bootloader,
            FirmwareComponent::Firmware => &self.firmware,
            FirmwareComponent::Ble => &self.ble,
            FirmwareComponent::Bridge => return None,
        };
        if v.is_empty() {
            None
        } else {
            Some(v.as_str())
        }
    }
}

/// Result of a single device status read.
///
/// Produced once per read and never mutated afterwards; callers clone it out
/// of the feature cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// Raw hardware serial used to match a physical device to its record
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub bootloader_mode: bool,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub no_backup: bool,
    #[serde(default)]
    pub firmware_present: bool,
    #[serde(default)]
    pub versions: DeviceVersions,
    /// Battery charge in percent, absent on USB-only families
    #[serde(default)]
    pub battery_level: Option<u8>,
    /// Advertised Bluetooth name
    #[serde(default)]
    pub ble_name: Option<String>,
    #[serde(default)]
    pub firmware_type: FirmwareType,
    #[serde(default)]
    pub label: Option<String>,
}

impl FeatureSnapshot {
    pub fn mode(&self) -> DeviceMode {
        if self.bootloader_mode {
            DeviceMode::Bootloader
        } else if !self.initialized {
            DeviceMode::NotInitialized
        } else if self.no_backup {
            DeviceMode::BackupMode
        } else {
            DeviceMode::Normal
        }
    }

    pub fn is_bootloader_mode(&self) -> bool {
        self.mode() == DeviceMode::Bootloader
    }
}

/// Persisted device record as seen by this core.
///
/// The registry owns the canonical record; only the connection handles,
/// cached versions and recheck flag are written from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    /// USB or bridge connection handle
    pub connect_id: String,
    /// Bluetooth connection handle, filled in after first pairing
    #[serde(default)]
    pub ble_connect_id: Option<String>,
    /// Raw hardware serial
    pub device_id: String,
    #[serde(default)]
    pub device_type: DeviceType,
    /// Advertised Bluetooth name stored at first connection
    #[serde(default)]
    pub ble_name: Option<String>,
    #[serde(default)]
    pub versions: DeviceVersions,
    #[serde(default)]
    pub firmware_type: FirmwareType,
    #[serde(default)]
    pub force_recheck_firmware: bool,
    #[serde(default)]
    pub features: Option<FeatureSnapshot>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn new(id: DeviceId, connect_id: &str, device_id: &str, device_type: DeviceType) -> Self {
        Self {
            id,
            connect_id: connect_id.to_string(),
            ble_connect_id: None,
            device_id: device_id.to_string(),
            device_type,
            ble_name: None,
            versions: DeviceVersions::default(),
            firmware_type: FirmwareType::default(),
            force_recheck_firmware: false,
            features: None,
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
