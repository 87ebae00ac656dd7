//! UI collaborator channel
//!
//! Two halves:
//! - a broadcast stream of [`UiEvent`]s (workflow state, prompts, progress)
//! - a pending-request table for questions the core must wait on. Each
//!   request gets a correlation id and is answered through a single
//!   [`UiChannel::complete`] entry point or expires after its timeout.

use serde::{Deserialize, Serialize};
use signet_core::{HardwareError, Result, RetryState, WorkflowState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::DialogKind;

/// Questions the core asks the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum UserRequest {
    /// Confirm scanning for and pairing the device over Bluetooth
    BluetoothPairing {
        connect_id: String,
        device_name: Option<String>,
    },
    BluetoothPermission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserResponse {
    Approved,
    Denied,
}

/// Event published to the UI collaborator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    EnterPinOnDevice {
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
    Dialog {
        dialog: DialogKind,
    },
    CloseDialog,
    Workflow {
        connect_id: String,
        state: WorkflowState,
    },
    Retry {
        retry: Option<RetryState>,
    },
    Request {
        id: Uuid,
        request: UserRequest,
    },
}

type PendingMap = HashMap<Uuid, oneshot::Sender<UserResponse>>;

#[derive(Clone)]
pub struct UiChannel {
    event_tx: broadcast::Sender<UiEvent>,
    pending: Arc<Mutex<PendingMap>>,
}

impl Default for UiChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl UiChannel {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            event_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.event_tx.subscribe()
    }

    /// Best effort, nobody listening is fine
    pub fn publish(&self, event: UiEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Ask the user and wait for the answer, at most `timeout`
    pub async fn request(&self, request: UserRequest, timeout: Duration) -> Result<UserResponse> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.lock_pending()?.insert(id, tx);

        debug!(request_id = %id, ?request, "Waiting for user response");
        self.publish(UiEvent::Request { id, request });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(HardwareError::Request(format!("request {} dropped", id))),
            Err(_) => {
                self.lock_pending()?.remove(&id);
                warn!(request_id = %id, "User request timed out");
                Err(HardwareError::timed_out("user_request", timeout))
            }
        }
    }

    /// Answer a pending request. Returns false when the id is unknown or expired.
    pub fn complete(&self, id: Uuid, response: UserResponse) -> bool {
        let sender = match self.lock_pending() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(request_id = %id, "No pending request for response");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().map(|p| p.len()).unwrap_or(0)
    }

    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, PendingMap>> {
        self.pending
            .lock()
            .map_err(|_| HardwareError::Request("pending request table poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_completed_by_id() {
        let ui = UiChannel::new();
        let mut rx = ui.subscribe();

        let answer = {
            let ui = ui.clone();
            tokio::spawn(async move {
                if let Ok(UiEvent::Request { id, .. }) = rx.recv().await {
                    assert!(ui.complete(id, UserResponse::Approved));
                }
            })
        };

        let response = ui
            .request(UserRequest::BluetoothPermission, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, UserResponse::Approved);
        answer.await.unwrap();
        assert_eq!(ui.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_and_is_removed() {
        let ui = UiChannel::new();
        let err = ui
            .request(UserRequest::BluetoothPermission, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::TimedOut { .. }));
        assert_eq!(ui.pending_count(), 0);
    }

    #[test]
    fn test_complete_unknown_id() {
        let ui = UiChannel::new();
        assert!(!ui.complete(Uuid::new_v4(), UserResponse::Denied));
    }
}
