//! Error taxonomy shared by every Signet crate
//!
//! Errors that reach the UI must cross a process boundary, so every
//! [`HardwareError`] serializes to a flat [`ErrorPayload`] object and can be
//! rebuilt from it.

use serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceType;
use crate::firmware::FirmwareComponent;

pub type Result<T> = std::result::Result<T, HardwareError>;

/// Coarse error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Precondition failed, nothing was touched
    Validation,
    /// Talking to the device failed
    DeviceComm,
    /// An install call failed
    Flash,
    /// Install reported success but the versions do not match
    VersionMismatch,
    /// Workflow exit or task clear
    Cancellation,
    /// Payload from the driver could not be understood
    Decode,
    /// Release backend or configuration failure
    Backend,
}

/// One component whose installed version differs from the requested one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMismatch {
    pub component: FirmwareComponent,
    pub expected: String,
    pub actual: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("mnemonic not backed up")]
    NotBackedUp,
    #[error("USB not connected")]
    UsbNotConnected,
    #[error("battery level {level}% is at or below {min}%")]
    BatteryTooLow { level: u8, min: u8 },
    #[error("bridge must be upgraded before updating firmware")]
    BridgeUpgradeRequired,
    #[error("installed version is below the minimum allowed for in-app update")]
    UpgradeFromWebRequired,
    #[error("full resource update requires the desktop updater")]
    UseDesktopToUpdate,
    #[error("{0} devices do not support this update path")]
    UnsupportedDevice(DeviceType),

    #[error("{method} timed out after {timeout_ms} ms")]
    TimedOut { method: String, timeout_ms: u64 },
    #[error("device not found")]
    DeviceNotFound,
    #[error("driver version mismatch: {0}")]
    DriverMismatch(String),
    #[error("connect id is required")]
    ConnectIdRequired,
    #[error("device call failed: {0}")]
    Device(String),
    #[error("bridge not reachable: {0}")]
    BridgeUnreachable(String),

    #[error("{component} install failed: {message}")]
    Flash {
        component: FirmwareComponent,
        message: String,
    },

    #[error("installed versions do not match requested versions")]
    VersionMismatchAfterInstall(Vec<VersionMismatch>),

    #[error("firmware update workflow exited")]
    WorkflowExited,
    #[error("update task cleared: {0}")]
    Cleared(String),

    #[error("cannot decode payload: {0}")]
    Decode(String),

    #[error("release backend failed: {0}")]
    Backend(String),
    #[error("user request failed: {0}")]
    Request(String),
}

impl HardwareError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HardwareError::NotBackedUp
            | HardwareError::UsbNotConnected
            | HardwareError::BatteryTooLow { .. }
            | HardwareError::BridgeUpgradeRequired
            | HardwareError::UpgradeFromWebRequired
            | HardwareError::UseDesktopToUpdate
            | HardwareError::UnsupportedDevice(_) => ErrorKind::Validation,
            HardwareError::TimedOut { .. }
            | HardwareError::DeviceNotFound
            | HardwareError::DriverMismatch(_)
            | HardwareError::ConnectIdRequired
            | HardwareError::Device(_)
            | HardwareError::BridgeUnreachable(_) => ErrorKind::DeviceComm,
            HardwareError::Flash { .. } => ErrorKind::Flash,
            HardwareError::VersionMismatchAfterInstall(_) => ErrorKind::VersionMismatch,
            HardwareError::WorkflowExited | HardwareError::Cleared(_) => ErrorKind::Cancellation,
            HardwareError::Decode(_) => ErrorKind::Decode,
            HardwareError::Backend(_) | HardwareError::Request(_) => ErrorKind::Backend,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            HardwareError::NotBackedUp => "not_backed_up",
            HardwareError::UsbNotConnected => "usb_not_connected",
            HardwareError::BatteryTooLow { .. } => "battery_too_low",
            HardwareError::BridgeUpgradeRequired => "bridge_upgrade_required",
            HardwareError::UpgradeFromWebRequired => "upgrade_from_web_required",
            HardwareError::UseDesktopToUpdate => "use_desktop_to_update",
            HardwareError::UnsupportedDevice(_) => "unsupported_device",
            HardwareError::TimedOut { .. } => "timed_out",
            HardwareError::DeviceNotFound => "device_not_found",
            HardwareError::DriverMismatch(_) => "driver_mismatch",
            HardwareError::ConnectIdRequired => "connect_id_required",
            HardwareError::Device(_) => "device",
            HardwareError::BridgeUnreachable(_) => "bridge_unreachable",
            HardwareError::Flash { .. } => "flash",
            HardwareError::VersionMismatchAfterInstall(_) => "version_mismatch_after_install",
            HardwareError::WorkflowExited => "workflow_exited",
            HardwareError::Cleared(_) => "cleared",
            HardwareError::Decode(_) => "decode",
            HardwareError::Backend(_) => "backend",
            HardwareError::Request(_) => "request",
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    pub fn timed_out(method: &str, timeout: std::time::Duration) -> Self {
        HardwareError::TimedOut {
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let mismatches = match self {
            HardwareError::VersionMismatchAfterInstall(m) => m.clone(),
            _ => Vec::new(),
        };
        ErrorPayload {
            kind: self.kind(),
            code: self.code().to_string(),
            message: self.to_string(),
            mismatches,
        }
    }
}

/// Plain-object form of [`HardwareError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<VersionMismatch>,
}

impl From<ErrorPayload> for HardwareError {
    /// Rebuild a typed error; variants with structured fields fall back to
    /// the closest string-carrying variant of the same kind.
    fn from(payload: ErrorPayload) -> Self {
        match payload.code.as_str() {
            "not_backed_up" => HardwareError::NotBackedUp,
            "usb_not_connected" => HardwareError::UsbNotConnected,
            "bridge_upgrade_required" => HardwareError::BridgeUpgradeRequired,
            "upgrade_from_web_required" => HardwareError::UpgradeFromWebRequired,
            "use_desktop_to_update" => HardwareError::UseDesktopToUpdate,
            "device_not_found" => HardwareError::DeviceNotFound,
            "connect_id_required" => HardwareError::ConnectIdRequired,
            "workflow_exited" => HardwareError::WorkflowExited,
            "version_mismatch_after_install" => {
                HardwareError::VersionMismatchAfterInstall(payload.mismatches)
            }
            "cleared" => HardwareError::Cleared(payload.message),
            "driver_mismatch" => HardwareError::DriverMismatch(payload.message),
            "decode" => HardwareError::Decode(payload.message),
            _ => match payload.kind {
                ErrorKind::Cancellation => HardwareError::Cleared(payload.message),
                ErrorKind::Decode => HardwareError::Decode(payload.message),
                ErrorKind::Backend => HardwareError::Backend(payload.message),
                _ => HardwareError::Device(payload.message),
            },
        }
    }
}

impl Serialize for HardwareError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_payload().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HardwareError {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        ErrorPayload::deserialize(deserializer).map(HardwareError::from)
    }
}

impl From<serde_json::Error> for HardwareError {
    fn from(e: serde_json::Error) -> Self {
        HardwareError::Decode(e.to_string())
    }
}
