//! Signet Transport - Sessions and device access
//!
//! Sits between callers and the [`DeviceDriver`]:
//! - Negotiates the transport for each call and keeps it consistent
//! - Hands out driver sessions and forwards driver events to the UI
//! - Serializes and caches device status reads
//! - Resolves which connection handle reaches a known device

pub mod bridge;
pub mod driver;
pub mod events;
pub mod features;
pub mod identity;
pub mod negotiator;
pub mod registry;
pub mod session;
pub mod settings;
pub mod ui;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::{BridgeClient, BRIDGE_PROBE_TIMEOUT, DEFAULT_BRIDGE_URL};
pub use driver::{
    BleState, BridgeCheck, DeviceDriver, InstallAllRequest, InstallRequest, Platform,
    RawDeviceEvent, SearchedDevice, StatusOptions,
};
pub use events::{DeviceEvent, DialogKind, SkippedEvent};
pub use features::{FeatureGate, FeatureGateConfig};
pub use identity::{IdentityConfig, IdentityResolver};
pub use negotiator::{EnvironmentProbe, HostEnvironment, NegotiatorConfig, TransportNegotiator};
pub use registry::{DeviceRegistry, InMemoryDeviceRegistry};
pub use session::{BridgeStatus, SessionConfig, SessionFacade, SessionHandle};
pub use settings::{InMemoryTransportSettings, TransportSettings};
pub use ui::{UiChannel, UiEvent, UserRequest, UserResponse};
