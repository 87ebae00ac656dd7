//! Decoding of driver events into a closed set of variants

use serde::{Deserialize, Serialize};
use signet_core::{FeatureSnapshot, HardwareError, Result};

use crate::driver::RawDeviceEvent;

/// Dialogs that the driver asks the host to show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    BluetoothPermission,
    BluetoothCharacteristicNotifyChangeFailure,
    WebDevicePromptAccessPermission,
}

/// Events that only close driver-side windows. Surfacing them would
/// re-open a dialog the user just dismissed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkippedEvent {
    CloseUiWindow,
    CloseUiPinWindow,
    PreviousAddress,
    BluetoothUnsupported,
    BluetoothPoweredOff,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    RequestPin {
        connect_id: Option<String>,
    },
    RequestPassphrase {
        connect_id: Option<String>,
    },
    FirmwareTip {
        message: String,
    },
    FirmwareProgress {
        progress: u8,
        progress_type: Option<String>,
    },
    SupportFeatures {
        connect_id: String,
        features: FeatureSnapshot,
    },
    ReleaseInfo {
        ble: bool,
        payload: serde_json::Value,
    },
    Log {
        message: String,
    },
    Dialog(DialogKind),
    Skipped(SkippedEvent),
}

#[derive(Deserialize)]
struct DevicePayload {
    #[serde(default)]
    connect_id: Option<String>,
}

#[derive(Deserialize)]
struct TipPayload {
    message: String,
}

#[derive(Deserialize)]
struct ProgressPayload {
    progress: u8,
    #[serde(default)]
    progress_type: Option<String>,
}

#[derive(Deserialize)]
struct FeaturesPayload {
    connect_id: String,
    features: FeatureSnapshot,
}

fn payload<T: serde::de::DeserializeOwned>(raw: &RawDeviceEvent) -> Result<T> {
    serde_json::from_value(raw.payload.clone())
        .map_err(|e| HardwareError::Decode(format!("{}: {}", raw.kind, e)))
}

impl DeviceEvent {
    pub fn decode(raw: &RawDeviceEvent) -> Result<Self> {
        let event = match raw.kind.as_str() {
            "request_pin" => {
                let p: DevicePayload = payload(raw)?;
                DeviceEvent::RequestPin {
                    connect_id: p.connect_id,
                }
            }
            "request_passphrase" => {
                let p: DevicePayload = payload(raw)?;
                DeviceEvent::RequestPassphrase {
                    connect_id: p.connect_id,
                }
            }
            "firmware_tip" => {
                let p: TipPayload = payload(raw)?;
                DeviceEvent::FirmwareTip { message: p.message }
            }
            "firmware_progress" => {
                let p: ProgressPayload = payload(raw)?;
                DeviceEvent::FirmwareProgress {
                    progress: p.progress.min(100),
                    progress_type: p.progress_type,
                }
            }
            "support_features" => {
                let p: FeaturesPayload = payload(raw)?;
                DeviceEvent::SupportFeatures {
                    connect_id: p.connect_id,
                    features: p.features,
                }
            }
            "release_info" | "ble_release_info" => DeviceEvent::ReleaseInfo {
                ble: raw.kind == "ble_release_info",
                payload: raw.payload.clone(),
            },
            "log" => DeviceEvent::Log {
                message: raw
                    .payload
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "bluetooth_permission" => DeviceEvent::Dialog(DialogKind::BluetoothPermission),
            "bluetooth_characteristic_notify_change_failure" => {
                DeviceEvent::Dialog(DialogKind::BluetoothCharacteristicNotifyChangeFailure)
            }
            "web_device_prompt_access_permission" => {
                DeviceEvent::Dialog(DialogKind::WebDevicePromptAccessPermission)
            }
            "close_ui_window" => DeviceEvent::Skipped(SkippedEvent::CloseUiWindow),
            "close_ui_pin_window" => DeviceEvent::Skipped(SkippedEvent::CloseUiPinWindow),
            "previous_address" => DeviceEvent::Skipped(SkippedEvent::PreviousAddress),
            "bluetooth_unsupported" => DeviceEvent::Skipped(SkippedEvent::BluetoothUnsupported),
            "bluetooth_powered_off" => DeviceEvent::Skipped(SkippedEvent::BluetoothPoweredOff),
            other => {
                return Err(HardwareError::Decode(format!("unknown event type: {}", other)));
            }
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_progress() {
        let raw = RawDeviceEvent::new(
            "firmware_progress",
            json!({"progress": 42, "progress_type": "installing"}),
        );
        assert_eq!(
            DeviceEvent::decode(&raw).unwrap(),
            DeviceEvent::FirmwareProgress {
                progress: 42,
                progress_type: Some("installing".to_string())
            }
        );
    }

    #[test]
    fn test_skipped_events() {
        for kind in [
            "close_ui_window",
            "close_ui_pin_window",
            "previous_address",
            "bluetooth_unsupported",
            "bluetooth_powered_off",
        ] {
            let event = DeviceEvent::decode(&RawDeviceEvent::new(kind, json!(null))).unwrap();
            assert!(matches!(event, DeviceEvent::Skipped(_)), "{kind}");
        }
    }

    #[test]
    fn test_unknown_shape_is_decode_error() {
        let err = DeviceEvent::decode(&RawDeviceEvent::new("firmware_tip", json!({"tip": 1})))
            .unwrap_err();
        assert!(matches!(err, HardwareError::Decode(_)));

        let err = DeviceEvent::decode(&RawDeviceEvent::new("mystery", json!({}))).unwrap_err();
        assert!(matches!(err, HardwareError::Decode(_)));
    }

    #[test]
    fn test_request_pin_without_payload() {
        let event = DeviceEvent::decode(&RawDeviceEvent::new("request_pin", json!({}))).unwrap();
        assert_eq!(event, DeviceEvent::RequestPin { connect_id: None });
    }
}
