//! Configuration loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use signet_core::{DeviceType, TransportKind};
use signet_transport::{Platform, DEFAULT_BRIDGE_URL};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::dev_settings::DevSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub dev: DevSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bridge daemon base URL
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// Persisted USB flavour used until a probe says otherwise
    #[serde(default = "default_usb_transport")]
    pub usb_transport: TransportKind,
    /// Bluetooth transport of this host
    #[serde(default = "default_ble_transport")]
    pub ble_transport: TransportKind,
    #[serde(default)]
    pub enable_desktop_bluetooth: bool,
    /// Reject mismatched driver library versions
    #[serde(default)]
    pub strict_driver_versions: bool,
    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,
    #[serde(default = "default_status_cache_ttl")]
    pub status_cache_ttl_secs: u64,
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            usb_transport: default_usb_transport(),
            ble_transport: default_ble_transport(),
            enable_desktop_bluetooth: false,
            strict_driver_versions: false,
            status_timeout_secs: default_status_timeout(),
            status_cache_ttl_secs: default_status_cache_ttl(),
            pairing_timeout_secs: default_pairing_timeout(),
        }
    }
}

fn default_bridge_url() -> String {
    DEFAULT_BRIDGE_URL.to_string()
}

fn default_usb_transport() -> TransportKind {
    TransportKind::Bridge
}

fn default_ble_transport() -> TransportKind {
    TransportKind::DesktopWebBle
}

fn default_status_timeout() -> u64 {
    60
}

fn default_status_cache_ttl() -> u64 {
    15
}

fn default_pairing_timeout() -> u64 {
    120
}

/// Update workflow timing, all values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub platform: Platform,
    /// Wait for other device work to settle before starting
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Wait after cancelling in-flight calls before a release check
    #[serde(default = "default_cancel_settle_ms")]
    pub cancel_settle_ms: u64,
    #[serde(default)]
    pub reboot: RebootDelays,
    /// Budget for the status re-read before a retried task
    #[serde(default = "default_retry_probe_timeout_ms")]
    pub retry_probe_timeout_ms: u64,
    /// Wait after a single-shot install before verifying versions
    #[serde(default = "default_verify_wait_ms")]
    pub verify_wait_ms: u64,
    /// Minimum time between automatic update checks of one device
    #[serde(default = "default_detect_interval_secs")]
    pub detect_interval_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            settle_ms: default_settle_ms(),
            cancel_settle_ms: default_cancel_settle_ms(),
            reboot: RebootDelays::default(),
            retry_probe_timeout_ms: default_retry_probe_timeout_ms(),
            verify_wait_ms: default_verify_wait_ms(),
            detect_interval_secs: default_detect_interval_secs(),
        }
    }
}

fn default_settle_ms() -> u64 {
    3_000
}

fn default_cancel_settle_ms() -> u64 {
    1_000
}

fn default_retry_probe_timeout_ms() -> u64 {
    30_000
}

fn default_verify_wait_ms() -> u64 {
    1_500
}

fn default_detect_interval_secs() -> u64 {
    1_800
}

/// Fixed waits for the device to reboot between phases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootDelays {
    #[serde(default = "default_next_phase_ms")]
    pub next_phase_ms: u64,
    #[serde(default = "default_next_phase_webusb_ms")]
    pub next_phase_webusb_ms: u64,
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    /// Touchscreen families only
    #[serde(default = "default_ble_done_ms")]
    pub ble_done_ms: u64,
    /// Touchscreen families only
    #[serde(default = "default_bootloader_done_ms")]
    pub bootloader_done_ms: u64,
    #[serde(default = "default_done_ms")]
    pub done_ms: u64,
    #[serde(default = "default_done_mini_ms")]
    pub done_mini_ms: u64,
}

impl Default for RebootDelays {
    fn default() -> Self {
        Self {
            next_phase_ms: default_next_phase_ms(),
            next_phase_webusb_ms: default_next_phase_webusb_ms(),
            retry_ms: default_retry_ms(),
            ble_done_ms: default_ble_done_ms(),
            bootloader_done_ms: default_bootloader_done_ms(),
            done_ms: default_done_ms(),
            done_mini_ms: default_done_mini_ms(),
        }
    }
}

fn default_next_phase_ms() -> u64 {
    15_000
}

fn default_next_phase_webusb_ms() -> u64 {
    20_000
}

fn default_retry_ms() -> u64 {
    5_000
}

fn default_ble_done_ms() -> u64 {
    15_000
}

fn default_bootloader_done_ms() -> u64 {
    20_000
}

fn default_done_ms() -> u64 {
    2_000
}

fn default_done_mini_ms() -> u64 {
    5_000
}

/// Lowest installed versions that may still be updated in-app
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinVersions {
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub ble: Option<String>,
    #[serde(default)]
    pub bootloader: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Battery percentage at or below which updates are refused
    #[serde(default = "default_min_battery_level")]
    pub min_battery_level: u8,
    /// Keyed by device type name
    #[serde(default = "default_min_versions")]
    pub min_versions: BTreeMap<String, MinVersions>,
    /// Bootloader floor when the table has none
    #[serde(default = "default_bootloader_floor")]
    pub default_bootloader_floor: String,
    /// `[min, limit]`: touch devices below `min` updating to `limit` or later
    /// need a full resource update
    #[serde(default = "default_full_resource_range")]
    pub full_resource_range: [String; 2],
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_battery_level: default_min_battery_level(),
            min_versions: default_min_versions(),
            default_bootloader_floor: default_bootloader_floor(),
            full_resource_range: default_full_resource_range(),
        }
    }
}

impl ValidationConfig {
    pub fn min_versions_for(&self, device_type: DeviceType) -> Option<&MinVersions> {
        self.min_versions.get(device_type.as_str())
    }
}

fn default_min_battery_level() -> u8 {
    25
}

fn default_min_versions() -> BTreeMap<String, MinVersions> {
    let entry = |firmware: &str, ble: &str, bootloader: &str| MinVersions {
        firmware: Some(firmware.to_string()),
        ble: Some(ble.to_string()),
        bootloader: Some(bootloader.to_string()),
    };
    BTreeMap::from([
        (
            DeviceType::Classic.as_str().to_string(),
            entry("2.1.0", "1.2.0", "1.8.9"),
        ),
        (
            DeviceType::Mini.as_str().to_string(),
            entry("2.3.0", "1.0.0", "1.8.9"),
        ),
        (
            DeviceType::Touch.as_str().to_string(),
            entry("3.0.0", "2.0.0", "2.0.0"),
        ),
    ])
}

fn default_bootloader_floor() -> String {
    "2.0.0".to_string()
}

fn default_full_resource_range() -> [String; 2] {
    ["3.5.0".to_string(), "3.5.0".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Release verification service; checks are skipped when unset
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_backend_timeout(),
        }
    }
}

fn default_backend_timeout() -> u64 {
    30
}

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        backend: BackendConfig {
            url: Some("https://firmware.signet.dev/api/verify".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.validation.min_battery_level, 25);
        assert_eq!(config.update.reboot.next_phase_webusb_ms, 20_000);
        assert_eq!(config.transport.bridge_url, "http://localhost:21320");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signet.toml");
        std::fs::write(
            &path,
            r#"
[transport]
usb_transport = "webusb"
enable_desktop_bluetooth = true

[validation.min_versions.pro]
firmware = "4.0.0"

[dev]
low_battery_level = true
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.transport.usb_transport, TransportKind::WebUsb);
        assert!(config.transport.enable_desktop_bluetooth);
        assert_eq!(config.transport.status_timeout_secs, 60);
        assert_eq!(
            config
                .validation
                .min_versions_for(DeviceType::Pro)
                .and_then(|m| m.firmware.as_deref()),
            Some("4.0.0")
        );
        assert!(config.validation.min_versions_for(DeviceType::Touch).is_none());
        assert!(config.dev.low_battery_level);
    }

    #[test]
    fn test_saved_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signet.toml");
        save_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert!(config.backend.url.is_some());
        assert_eq!(
            config.validation.full_resource_range,
            ["3.5.0".to_string(), "3.5.0".to_string()]
        );
    }
}
