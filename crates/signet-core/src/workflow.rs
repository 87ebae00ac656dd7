//! Update workflow state published to the UI

use serde::{Deserialize, Serialize};

use crate::error::ErrorPayload;
use crate::firmware::{FirmwareComponent, ReleaseCheckResult};

/// Progress of a running install
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallingInfo {
    /// `None` between phases, e.g. while re-probing after a retry
    pub current_phase: Option<FirmwareComponent>,
    pub total_phase: Vec<FirmwareComponent>,
    pub update_info: Option<Box<ReleaseCheckResult>>,
}

/// Live state of one update run. Replaced on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum WorkflowState {
    Init,
    CheckReleaseError { error: ErrorPayload },
    ShowChangelog { release: Box<ReleaseCheckResult> },
    ShowChecklist { release: Box<ReleaseCheckResult> },
    Installing(InstallingInfo),
    UpdateDone { release: Option<Box<ReleaseCheckResult>> },
    Error { reason: ErrorPayload },
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::UpdateDone { .. } | WorkflowState::Error { .. }
        )
    }

    pub fn step_name(&self) -> &'static str {
        match self {
            WorkflowState::Init => "init",
            WorkflowState::CheckReleaseError { .. } => "check_release_error",
            WorkflowState::ShowChangelog { .. } => "show_changelog",
            WorkflowState::ShowChecklist { .. } => "show_checklist",
            WorkflowState::Installing(_) => "installing",
            WorkflowState::UpdateDone { .. } => "update_done",
            WorkflowState::Error { .. } => "error",
        }
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::Init
    }
}

/// Retry offer for a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    pub task_id: String,
    pub error: ErrorPayload,
}
