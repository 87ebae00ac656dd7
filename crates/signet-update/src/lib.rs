//! Signet Update - Firmware release checking and the update workflow
//!
//! Built on `signet-transport`:
//! - Release checks per component, with verification links from a backend
//! - Preconditions that gate an update before anything is touched
//! - A retryable task queue that survives device reboots
//! - The phased update workflow and its single-shot variant
//! - A [`HardwareContext`] owning all of the above for one process

pub mod backend;
pub mod config;
pub mod context;
pub mod detect;
pub mod dev_settings;
pub mod release;
pub mod tasks;
pub mod validate;
pub mod workflow;

pub use backend::{HttpReleaseBackend, ReleaseBackend, VerifiedVersionInfos, VerifyRequest};
pub use config::{load_config, save_default_config, Config};
pub use context::HardwareContext;
pub use detect::DetectThrottle;
pub use dev_settings::{DevSettings, DevSettingsStore};
pub use release::ReleaseChecker;
pub use tasks::{TaskHandle, TaskQueueConfig, UpdateTaskQueue};
pub use validate::UpdateValidator;
pub use workflow::{reboot_delay, RebootPhase, UpdateWorkflow, UpdateWorkflowParams};
