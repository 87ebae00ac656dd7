//! Signet Core - Core types, release resolution and errors
//!
//! This crate provides the foundational types for the Signet system:
//! - Device records and status snapshots
//! - Release descriptors and the ordered upgrade rules
//! - The shared error taxonomy, serializable across process boundaries
//! - A bounded TTL cache used for short-lived device answers

pub mod cache;
pub mod device;
pub mod error;
pub mod firmware;
pub mod transport;
pub mod workflow;

pub use cache::TtlCache;
pub use device::{
    DeviceId, DeviceMode, DeviceRecord, DeviceType, DeviceVersions, FeatureSnapshot, FirmwareType,
};
pub use error::{ErrorKind, ErrorPayload, HardwareError, Result, VersionMismatch};
pub use firmware::{
    resolve_upgrade, version_gte, version_lt, ComponentUpdateInfo, FirmwareComponent,
    ForceUpdateOverrides, ReleaseCheckResult, ReleaseDescriptor, ReleaseStatus, ReleaseUrls,
    UpdateInfos, UpgradeDecision, PHASE_ORDER,
};
pub use transport::{CallContext, TransportKind};
pub use workflow::{InstallingInfo, RetryState, WorkflowState};
