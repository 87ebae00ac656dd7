//! Retryable update task queue
//!
//! Each install call runs as a task. A failing task is not rejected: its
//! error is published as retry state and the task stays registered until
//! the user retries it, or the workflow clears or exits.

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use signet_core::{
    HardwareError, InstallingInfo, ReleaseCheckResult, Result, RetryState, WorkflowState,
};
use signet_transport::{FeatureGate, StatusOptions, UiChannel, UiEvent};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type TaskFuture = BoxFuture<'static, Result<Value>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

struct Task {
    run: TaskFn,
    done: oneshot::Sender<Result<Value>>,
}

/// Completion side of an enqueued task
pub struct TaskHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<Result<Value>>,
}

impl TaskHandle {
    /// Wait until the task is resolved, rejected or cleared
    pub async fn wait(self) -> Result<Value> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(HardwareError::Cleared("task dropped".to_string())))
    }
}

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Wait for the device to come back before a retry
    pub retry_delay: Duration,
    /// Budget for the status re-read that precedes a retry
    pub retry_probe_timeout: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            retry_probe_timeout: Duration::from_secs(30),
        }
    }
}

pub struct UpdateTaskQueue {
    tasks: Mutex<HashMap<Uuid, Task>>,
    running: AtomicBool,
    retry: std::sync::Mutex<Option<RetryState>>,
    ui: UiChannel,
    gate: Arc<FeatureGate>,
    config: TaskQueueConfig,
}

impl UpdateTaskQueue {
    pub fn new(ui: UiChannel, gate: Arc<FeatureGate>, config: TaskQueueConfig) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            retry: std::sync::Mutex::new(None),
            ui,
            gate,
            config,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(HardwareError::WorkflowExited)
        }
    }

    /// Start a fresh run: drop leftovers of earlier runs and raise the flag
    pub async fn begin(&self, reason: &str) {
        self.clear_all(reason).await;
        self.running.store(true, Ordering::Release);
    }

    /// Stop the workflow; every registered task is rejected
    pub async fn exit(&self) {
        self.clear_all("exit_update_workflow").await;
        self.running.store(false, Ordering::Release);
        self.set_retry(None);
        info!("Update workflow exited");
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub fn retry_state(&self) -> Option<RetryState> {
        self.retry
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_retry(&self, retry: Option<RetryState>) {
        let changed = {
            let mut current = self.retry.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *current != retry;
            *current = retry.clone();
            changed
        };
        if changed {
            self.ui.publish(UiEvent::Retry { retry });
        }
    }

    pub async fn enqueue<F, Fut>(&self, f: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (done, rx) = oneshot::channel();
        let run: TaskFn = Arc::new(move || f().boxed());
        self.tasks.lock().await.insert(id, Task { run, done });
        debug!(task_id = %id, "Task enqueued");
        TaskHandle { id, rx }
    }

    pub async fn resolve(&self, id: Uuid, data: Value) -> bool {
        match self.tasks.lock().await.remove(&id) {
            Some(task) => {
                let _ = task.done.send(Ok(data));
                true
            }
            None => false,
        }
    }

    pub async fn reject(&self, id: Uuid, error: HardwareError) -> bool {
        match self.tasks.lock().await.remove(&id) {
            Some(task) => {
                debug!(task_id = %id, error = %error, "Task rejected");
                let _ = task.done.send(Err(error));
                true
            }
            None => false,
        }
    }

    pub async fn clear_all(&self, reason: &str) {
        let drained: Vec<(Uuid, Task)> = self.tasks.lock().await.drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), reason = %reason, "Clearing update tasks");
        }
        for (_, task) in drained {
            let _ = task
                .done
                .send(Err(HardwareError::Cleared(format!("clear_all: {}", reason))));
        }
    }

    /// Run a registered task once. Failures become retry state, not rejections.
    pub async fn run_task(&self, id: Uuid, pre: Option<BoxFuture<'_, Result<()>>>) {
        if let Err(e) = self.ensure_running() {
            self.reject(id, e).await;
            return;
        }

        let run = self.tasks.lock().await.get(&id).map(|t| t.run.clone());
        let Some(run) = run else {
            debug!(task_id = %id, "Task no longer registered");
            return;
        };

        self.set_retry(None);
        let result = async {
            if let Some(pre) = pre {
                pre.await?;
            }
            run().await
        }
        .await;

        match result {
            Ok(data) => {
                self.resolve(id, data).await;
                debug!(task_id = %id, "Task succeeded");
            }
            Err(e) if e.is_cancellation() || !self.is_running() => {
                debug!(task_id = %id, error = %e, "Task stopped by cancellation");
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Task failed, retry available");
                self.set_retry(Some(RetryState {
                    task_id: id.to_string(),
                    error: e.to_payload(),
                }));
                self.ui.publish(UiEvent::CloseDialog);
            }
        }

        if let Err(e) = self.ensure_running() {
            self.set_retry(None);
            self.reject(id, e).await;
        }
    }

    /// Run a failed task again after the device had time to restart
    pub async fn retry_task(
        &self,
        id: Uuid,
        connect_id: Option<&str>,
        release: Option<&ReleaseCheckResult>,
    ) {
        self.set_retry(None);
        tokio::time::sleep(self.config.retry_delay).await;

        let probe_timeout = self.config.retry_probe_timeout;
        let pre = async move {
            let opts = StatusOptions {
                allow_empty_connect_id: true,
            };
            let read = self.gate.get_status_fresh(connect_id, &opts);
            let outcome = match tokio::time::timeout(probe_timeout, read).await {
                Ok(Ok(features)) => {
                    debug!(task_id = %id, device_type = %features.device_type, "Device ready for retry");
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => HardwareError::timed_out("retry_timeout", probe_timeout),
            };
            self.publish_installing_without_phase(connect_id, release);
            Err(outcome)
        }
        .boxed();

        self.run_task(id, Some(pre)).await;
    }

    /// Enqueue, run once and wait for the outcome, retries included
    pub async fn run_with_retry<F, Fut>(&self, f: F) -> Result<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handle = self.enqueue(f).await;
        self.run_task(handle.id, None).await;
        handle.wait().await
    }

    fn publish_installing_without_phase(
        &self,
        connect_id: Option<&str>,
        release: Option<&ReleaseCheckResult>,
    ) {
        let connect_id = release
            .map(|r| r.connect_id.clone())
            .or_else(|| connect_id.map(str::to_string))
            .unwrap_or_default();
        self.ui.publish(UiEvent::Workflow {
            connect_id,
            state: WorkflowState::Installing(InstallingInfo {
                current_phase: None,
                total_phase: release.map(|r| r.total_phase.clone()).unwrap_or_default(),
                update_info: release.map(|r| Box::new(r.clone())),
            }),
        });
    }
}
