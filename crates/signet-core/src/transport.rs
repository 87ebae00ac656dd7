//! Transport kinds and call contexts

use serde::{Deserialize, Serialize};

/// Physical or logical channel used to reach a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local bridge daemon
    Bridge,
    /// Direct USB access from the host application
    #[serde(rename = "webusb")]
    WebUsb,
    /// Bluetooth LE from a desktop host
    DesktopWebBle,
    /// Bluetooth LE from a native mobile host
    Ble,
}

impl TransportKind {
    pub fn is_usb(&self) -> bool {
        matches!(self, TransportKind::Bridge | TransportKind::WebUsb)
    }

    pub fn is_ble(&self) -> bool {
        matches!(self, TransportKind::DesktopWebBle | TransportKind::Ble)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Bridge => "bridge",
            TransportKind::WebUsb => "webusb",
            TransportKind::DesktopWebBle => "desktop_web_ble",
            TransportKind::Ble => "ble",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a device call is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallContext {
    UserInteraction,
    /// User-initiated, but a Bluetooth permission dialog must not be shown
    UserInteractionNoBleDialog,
    BackgroundTask,
    SdkInitialization,
    SilentCall,
    UpdateFirmware,
}

impl CallContext {
    /// Contexts that must never trigger detection side effects
    pub fn skips_detection(&self) -> bool {
        matches!(
            self,
            CallContext::BackgroundTask | CallContext::SdkInitialization | CallContext::SilentCall
        )
    }

    /// Contexts in which no user prompt may be raised
    pub fn is_non_interactive(&self) -> bool {
        matches!(self, CallContext::BackgroundTask | CallContext::SilentCall)
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::UserInteraction
    }
}
