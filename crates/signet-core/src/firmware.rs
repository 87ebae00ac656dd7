//! Firmware release types and upgrade resolution
//!
//! This module provides:
//! - Release descriptors as reported for each installable component
//! - The ordered upgrade rules that turn a descriptor into a decision
//! - Aggregated release check results consumed by the update workflow

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::device::{DeviceType, FeatureSnapshot, FirmwareType};

/// Installable component of a device, plus the host-side bridge daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareComponent {
    Bootloader,
    Firmware,
    /// Companion radio firmware
    Ble,
    Bridge,
}

impl FirmwareComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirmwareComponent::Bootloader => "bootloader",
            FirmwareComponent::Firmware => "firmware",
            FirmwareComponent::Ble => "ble",
            FirmwareComponent::Bridge => "bridge",
        }
    }
}

impl std::fmt::Display for FirmwareComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-declared status of the installed version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Required,
    Valid,
    Outdated,
    None,
    Unknown,
}

impl Default for ReleaseStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Latest release for one component, as returned by a release check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub status: ReleaseStatus,
    /// Target version, `None` when the server has nothing to offer
    #[serde(default)]
    pub target_version: Option<String>,
    /// Changelog keyed by locale
    #[serde(default)]
    pub changelog: HashMap<String, String>,
    /// Explicit "must update" marker
    #[serde(default)]
    pub should_update: bool,
    /// Release was computed against a device in bootloader mode
    #[serde(default)]
    pub bootloader_mode: bool,
    /// A release payload is attached
    #[serde(default)]
    pub has_release: bool,
    /// Target firmware type differs from the installed one
    #[serde(default)]
    pub firmware_type_changed: bool,
    /// Installed version reported alongside the release (bridge only)
    #[serde(default)]
    pub installed_version: Option<String>,
}

/// Upgrade verdict for one component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDecision {
    pub has_upgrade: bool,
    pub has_upgrade_force: bool,
}

/// Developer override flags that force an upgrade regardless of versions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceUpdateOverrides {
    #[serde(default)]
    pub force_update_firmware: bool,
    #[serde(default)]
    pub force_update_ble: bool,
    #[serde(default)]
    pub force_update_bootloader: bool,
    #[serde(default)]
    pub force_update_once_firmware: bool,
    #[serde(default)]
    pub force_update_once_ble: bool,
    #[serde(default)]
    pub force_update_once_bootloader: bool,
}

impl ForceUpdateOverrides {
    pub fn forces(&self, component: FirmwareComponent) -> bool {
        match component {
            FirmwareComponent::Firmware => {
                self.force_update_firmware || self.force_update_once_firmware
            }
            FirmwareComponent::Ble => self.force_update_ble || self.force_update_once_ble,
            FirmwareComponent::Bootloader => {
                self.force_update_bootloader || self.force_update_once_bootloader
            }
            FirmwareComponent::Bridge => false,
        }
    }

    /// Drop the one-shot flags after a successful update
    pub fn clear_once(&mut self) {
        self.force_update_once_firmware = false;
        self.force_update_once_ble = false;
        self.force_update_once_bootloader = false;
    }
}

/// Inputs shared by every upgrade rule
pub struct RuleInput<'a> {
    pub component: FirmwareComponent,
    pub bootloader_mode: bool,
    pub from_version: Option<&'a str>,
    pub descriptor: &'a ReleaseDescriptor,
    pub overrides: &'a ForceUpdateOverrides,
}

type UpgradeRule = fn(&RuleInput<'_>, UpgradeDecision) -> UpgradeDecision;

/// Upgrade rules, applied in order. Later rules override earlier ones.
const UPGRADE_RULES: [(&str, UpgradeRule); 6] = [
    ("status", rule_status),
    ("bootloader_mode", rule_bootloader_mode),
    ("should_update", rule_should_update),
    ("monotonic_version", rule_monotonic_version),
    ("dev_override", rule_dev_override),
    ("status_valid", rule_status_valid),
];

fn rule_status(input: &RuleInput<'_>, mut decision: UpgradeDecision) -> UpgradeDecision {
    match input.descriptor.status {
        ReleaseStatus::Required => {
            decision.has_upgrade_force = true;
            decision.has_upgrade = true;
        }
        ReleaseStatus::Valid | ReleaseStatus::None => decision.has_upgrade = false,
        ReleaseStatus::Outdated => decision.has_upgrade = true,
        ReleaseStatus::Unknown => {}
    }
    decision
}

// Bootloader mode cannot report the installed firmware precisely.
fn rule_bootloader_mode(input: &RuleInput<'_>, mut decision: UpgradeDecision) -> UpgradeDecision {
    if input.bootloader_mode
        && input.descriptor.has_release
        && matches!(
            input.component,
            FirmwareComponent::Firmware | FirmwareComponent::Ble
        )
    {
        decision.has_upgrade = true;
    }
    decision
}

fn rule_should_update(input: &RuleInput<'_>, mut decision: UpgradeDecision) -> UpgradeDecision {
    if input.descriptor.should_update {
        decision.has_upgrade = true;
    }
    decision
}

fn rule_monotonic_version(input: &RuleInput<'_>, mut decision: UpgradeDecision) -> UpgradeDecision {
    if input.component == FirmwareComponent::Bootloader
        || input.bootloader_mode
        || input.descriptor.firmware_type_changed
    {
        return decision;
    }
    let (Some(from), Some(to)) = (input.from_version, input.descriptor.target_version.as_deref())
    else {
        return decision;
    };
    if version_gte(from, to) == Some(true) {
        decision.has_upgrade = false;
        decision.has_upgrade_force = false;
    }
    decision
}

fn rule_dev_override(input: &RuleInput<'_>, mut decision: UpgradeDecision) -> UpgradeDecision {
    if input.overrides.forces(input.component) {
        decision.has_upgrade = true;
    }
    decision
}

fn rule_status_valid(input: &RuleInput<'_>, mut decision: UpgradeDecision) -> UpgradeDecision {
    if input.descriptor.status == ReleaseStatus::Valid {
        decision.has_upgrade = false;
    }
    decision
}

/// Decide whether `component` needs an upgrade
pub fn resolve_upgrade(
    component: FirmwareComponent,
    snapshot: &FeatureSnapshot,
    descriptor: &ReleaseDescriptor,
    overrides: &ForceUpdateOverrides,
) -> UpgradeDecision {
    let from_version = descriptor
        .installed_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .or_else(|| snapshot.versions.get(component));
    let input = RuleInput {
        component,
        bootloader_mode: snapshot.bootloader_mode || descriptor.bootloader_mode,
        from_version,
        descriptor,
        overrides,
    };
    UPGRADE_RULES
        .iter()
        .fold(UpgradeDecision::default(), |decision, (name, rule)| {
            let next = rule(&input, decision);
            if next != decision {
                tracing::trace!(
                    component = %component,
                    rule = name,
                    has_upgrade = next.has_upgrade,
                    force = next.has_upgrade_force,
                    "Upgrade rule applied"
                );
            }
            next
        })
}

/// Clean a version string for semver parsing
/// Removes common prefixes (v, V) and surrounding whitespace
pub fn clean_version_string(version: &str) -> String {
    let v = version.trim();
    v.strip_prefix('v')
        .or_else(|| v.strip_prefix('V'))
        .unwrap_or(v)
        .to_string()
}

pub fn parse_version(version: &str) -> Option<semver::Version> {
    semver::Version::parse(&clean_version_string(version)).ok()
}

/// `Some(from >= to)` when both sides parse as semver
pub fn version_gte(from: &str, to: &str) -> Option<bool> {
    Some(parse_version(from)? >= parse_version(to)?)
}

/// `Some(from < to)` when both sides parse as semver
pub fn version_lt(from: &str, to: &str) -> Option<bool> {
    Some(parse_version(from)? < parse_version(to)?)
}

/// Download locations returned by the release verification backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseUrls {
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub github_release_url: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Upgrade information for one component of one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentUpdateInfo {
    pub component: FirmwareComponent,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub has_upgrade: bool,
    pub has_upgrade_force: bool,
    pub release: ReleaseDescriptor,
    #[serde(default)]
    pub release_urls: Option<ReleaseUrls>,
}

impl ComponentUpdateInfo {
    pub fn new(
        component: FirmwareComponent,
        snapshot: &FeatureSnapshot,
        release: ReleaseDescriptor,
        overrides: &ForceUpdateOverrides,
    ) -> Self {
        let decision = resolve_upgrade(component, snapshot, &release, overrides);
        let from_version = release
            .installed_version
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| snapshot.versions.get(component).map(str::to_string));
        Self {
            component,
            from_version,
            to_version: release.target_version.clone(),
            has_upgrade: decision.has_upgrade,
            has_upgrade_force: decision.has_upgrade_force,
            release,
            release_urls: None,
        }
    }
}

/// Per-component update infos of a release check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInfos {
    pub bootloader: Option<ComponentUpdateInfo>,
    pub firmware: Option<ComponentUpdateInfo>,
    pub ble: Option<ComponentUpdateInfo>,
    pub bridge: Option<ComponentUpdateInfo>,
}

impl UpdateInfos {
    pub fn get(&self, component: FirmwareComponent) -> Option<&ComponentUpdateInfo> {
        match component {
            FirmwareComponent::Bootloader => self.bootloader.as_ref(),
            FirmwareComponent::Firmware => self.firmware.as_ref(),
            FirmwareComponent::Ble => self.ble.as_ref(),
            FirmwareComponent::Bridge => self.bridge.as_ref(),
        }
    }

    pub fn get_mut(&mut self, component: FirmwareComponent) -> Option<&mut ComponentUpdateInfo> {
        match component {
            FirmwareComponent::Bootloader => self.bootloader.as_mut(),
            FirmwareComponent::Firmware => self.firmware.as_mut(),
            FirmwareComponent::Ble => self.ble.as_mut(),
            FirmwareComponent::Bridge => self.bridge.as_mut(),
        }
    }

    pub fn has_upgrade(&self, component: FirmwareComponent) -> bool {
        self.get(component).map(|i| i.has_upgrade).unwrap_or(false)
    }

    pub fn bridge_should_update(&self) -> bool {
        self.bridge
            .as_ref()
            .map(|b| b.release.should_update)
            .unwrap_or(false)
    }
}

/// Install order of the device-side phases
pub const PHASE_ORDER: [FirmwareComponent; 3] = [
    FirmwareComponent::Bootloader,
    FirmwareComponent::Firmware,
    FirmwareComponent::Ble,
];

/// Aggregated result of checking every component of one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseCheckResult {
    pub connect_id: String,
    pub device_type: DeviceType,
    pub is_bootloader_mode: bool,
    pub firmware_type: FirmwareType,
    pub features: FeatureSnapshot,
    pub update_infos: UpdateInfos,
    pub has_upgrade: bool,
    /// Components that will be installed, in install order
    pub total_phase: Vec<FirmwareComponent>,
}

impl ReleaseCheckResult {
    pub fn new(
        connect_id: &str,
        features: FeatureSnapshot,
        update_infos: UpdateInfos,
        all_is_up_to_date: bool,
    ) -> Self {
        let total_phase: Vec<FirmwareComponent> = PHASE_ORDER
            .iter()
            .copied()
            .filter(|c| update_infos.has_upgrade(*c))
            .collect();
        let has_upgrade = !all_is_up_to_date && !total_phase.is_empty();
        Self {
            connect_id: connect_id.to_string(),
            device_type: features.device_type,
            is_bootloader_mode: features.bootloader_mode,
            firmware_type: features.firmware_type,
            features,
            update_infos,
            has_upgrade,
            total_phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceVersions;

    fn make_snapshot(firmware: &str, bootloader_mode: bool) -> FeatureSnapshot {
        FeatureSnapshot {
            initialized: true,
            bootloader_mode,
            versions: DeviceVersions {
                bootloader: "2.0.0".to_string(),
                firmware: firmware.to_string(),
                ble: "1.0.0".to_string(),
            },
            ..Default::default()
        }
    }

    fn make_release(status: ReleaseStatus, target: &str) -> ReleaseDescriptor {
        ReleaseDescriptor {
            status,
            target_version: Some(target.to_string()),
            has_release: true,
            ..Default::default()
        }
    }

    fn all_overrides() -> ForceUpdateOverrides {
        ForceUpdateOverrides {
            force_update_firmware: true,
            force_update_ble: true,
            force_update_bootloader: true,
            force_update_once_firmware: true,
            force_update_once_ble: true,
            force_update_once_bootloader: true,
        }
    }

    #[test]
    fn test_outdated_with_newer_target() {
        let decision = resolve_upgrade(
            FirmwareComponent::Firmware,
            &make_snapshot("1.0.0", false),
            &make_release(ReleaseStatus::Outdated, "2.0.0"),
            &ForceUpdateOverrides::default(),
        );
        assert_eq!(
            decision,
            UpgradeDecision {
                has_upgrade: true,
                has_upgrade_force: false
            }
        );
    }

    #[test]
    fn test_outdated_with_equal_version_is_guarded() {
        let decision = resolve_upgrade(
            FirmwareComponent::Firmware,
            &make_snapshot("2.0.0", false),
            &make_release(ReleaseStatus::Outdated, "2.0.0"),
            &ForceUpdateOverrides::default(),
        );
        assert!(!decision.has_upgrade);
    }

    #[test]
    fn test_monotonic_guard_for_newer_installed() {
        for component in [FirmwareComponent::Firmware, FirmwareComponent::Ble] {
            let mut snapshot = make_snapshot("3.1.0", false);
            snapshot.versions.ble = "3.1.0".to_string();
            let decision = resolve_upgrade(
                component,
                &snapshot,
                &make_release(ReleaseStatus::Outdated, "3.0.9"),
                &ForceUpdateOverrides::default(),
            );
            assert!(!decision.has_upgrade, "{component} should be guarded");
        }
    }

    #[test]
    fn test_monotonic_guard_skips_bootloader() {
        let decision = resolve_upgrade(
            FirmwareComponent::Bootloader,
            &make_snapshot("1.0.0", false),
            &make_release(ReleaseStatus::Outdated, "2.0.0"),
            &ForceUpdateOverrides::default(),
        );
        // installed bootloader 2.0.0 == target, still outdated per server
        assert!(decision.has_upgrade);
    }

    #[test]
    fn test_monotonic_guard_skips_firmware_type_change() {
        let mut release = make_release(ReleaseStatus::Outdated, "2.0.0");
        release.firmware_type_changed = true;
        let decision = resolve_upgrade(
            FirmwareComponent::Firmware,
            &make_snapshot("2.0.0", false),
            &release,
            &ForceUpdateOverrides::default(),
        );
        assert!(decision.has_upgrade);
    }

    #[test]
    fn test_required_forces_older_installed() {
        let decision = resolve_upgrade(
            FirmwareComponent::Firmware,
            &make_snapshot("1.0.0", false),
            &make_release(ReleaseStatus::Required, "2.0.0"),
            &ForceUpdateOverrides::default(),
        );
        assert_eq!(
            decision,
            UpgradeDecision {
                has_upgrade: true,
                has_upgrade_force: true
            }
        );

        // the version guard never applies to the bootloader
        let decision = resolve_upgrade(
            FirmwareComponent::Bootloader,
            &make_snapshot("1.0.0", false),
            &make_release(ReleaseStatus::Required, "0.1.0"),
            &ForceUpdateOverrides::default(),
        );
        assert!(decision.has_upgrade_force);
    }

    #[test]
    fn test_required_cleared_when_installed_reaches_target() {
        for from in ["2.0.0", "3.0.0"] {
            let decision = resolve_upgrade(
                FirmwareComponent::Firmware,
                &make_snapshot(from, false),
                &make_release(ReleaseStatus::Required, "2.0.0"),
                &ForceUpdateOverrides::default(),
            );
            assert_eq!(decision, UpgradeDecision::default(), "installed {from}");
        }
    }

    #[test]
    fn test_valid_always_wins() {
        for component in PHASE_ORDER {
            for bootloader_mode in [false, true] {
                for from in ["0.1.0", "9.9.9", ""] {
                    let mut release = make_release(ReleaseStatus::Valid, "5.0.0");
                    release.should_update = true;
                    let decision = resolve_upgrade(
                        component,
                        &make_snapshot(from, bootloader_mode),
                        &release,
                        &all_overrides(),
                    );
                    assert!(!decision.has_upgrade, "{component} {from} {bootloader_mode}");
                }
            }
        }
    }

    #[test]
    fn test_bootloader_mode_firmware_without_version() {
        let decision = resolve_upgrade(
            FirmwareComponent::Firmware,
            &make_snapshot("", true),
            &make_release(ReleaseStatus::None, "4.0.0"),
            &ForceUpdateOverrides::default(),
        );
        assert!(decision.has_upgrade);
    }

    #[test]
    fn test_should_update_flag() {
        let mut release = make_release(ReleaseStatus::None, "1.0.0");
        release.should_update = true;
        let decision = resolve_upgrade(
            FirmwareComponent::Ble,
            &make_snapshot("", false),
            &release,
            &ForceUpdateOverrides::default(),
        );
        assert!(decision.has_upgrade);
    }

    #[test]
    fn test_dev_override_forces_component() {
        let overrides = ForceUpdateOverrides {
            force_update_once_ble: true,
            ..Default::default()
        };
        let snapshot = make_snapshot("2.0.0", false);
        let release = make_release(ReleaseStatus::None, "1.0.0");
        assert!(resolve_upgrade(FirmwareComponent::Ble, &snapshot, &release, &overrides).has_upgrade);
        assert!(
            !resolve_upgrade(FirmwareComponent::Firmware, &snapshot, &release, &overrides)
                .has_upgrade
        );
    }

    #[test]
    fn test_bridge_uses_installed_version() {
        let mut release = make_release(ReleaseStatus::Outdated, "2.2.0");
        release.installed_version = Some("2.2.0".to_string());
        let info = ComponentUpdateInfo::new(
            FirmwareComponent::Bridge,
            &make_snapshot("1.0.0", false),
            release,
            &ForceUpdateOverrides::default(),
        );
        assert_eq!(info.from_version.as_deref(), Some("2.2.0"));
        assert!(!info.has_upgrade);
    }

    #[test]
    fn test_total_phase_order_and_up_to_date_flag() {
        let snapshot = make_snapshot("1.0.0", false);
        let overrides = ForceUpdateOverrides::default();
        let infos = UpdateInfos {
            bootloader: Some(ComponentUpdateInfo::new(
                FirmwareComponent::Bootloader,
                &snapshot,
                make_release(ReleaseStatus::Outdated, "2.1.0"),
                &overrides,
            )),
            firmware: Some(ComponentUpdateInfo::new(
                FirmwareComponent::Firmware,
                &snapshot,
                make_release(ReleaseStatus::Outdated, "2.0.0"),
                &overrides,
            )),
            ble: Some(ComponentUpdateInfo::new(
                FirmwareComponent::Ble,
                &snapshot,
                make_release(ReleaseStatus::Valid, "1.0.0"),
                &overrides,
            )),
            bridge: None,
        };
        let result = ReleaseCheckResult::new("usb-1", snapshot.clone(), infos.clone(), false);
        assert_eq!(
            result.total_phase,
            vec![FirmwareComponent::Bootloader, FirmwareComponent::Firmware]
        );
        assert!(result.has_upgrade);

        let result = ReleaseCheckResult::new("usb-1", snapshot, infos, true);
        assert!(!result.has_upgrade);
    }

    #[test]
    fn test_version_helpers() {
        assert_eq!(clean_version_string(" v1.2.3 "), "1.2.3");
        assert_eq!(version_gte("V2.0.0", "2.0.0"), Some(true));
        assert_eq!(version_lt("1.9.9", "2.0.0"), Some(true));
        assert_eq!(version_lt("not-semver", "2.0.0"), None);
    }
}
