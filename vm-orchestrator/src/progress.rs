//! Tracking of long-running backend operations.
//!
//! Backends only deliver completion while their event queue is being serviced,
//! so waiting is a loop of poll, service, sleep. The sleep goes through tokio's
//! clock, which lets tests run with paused time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;
use vm_core::error::{result_code, ErrorDetail};
use vm_provider::{BackendProgress, VirtualizationBackend};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressKind {
    CreateStorage,
    Launch,
    PowerDown,
}

/// Awaitable view of one backend operation. Clones observe the same operation.
#[derive(Clone)]
pub struct ProgressHandle {
    id: Uuid,
    kind: ProgressKind,
    description: String,
    progress: Arc<dyn BackendProgress>,
}

impl fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("description", &self.description)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl ProgressHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ProgressKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn percent(&self) -> u32 {
        self.progress.percent()
    }

    pub fn is_completed(&self) -> bool {
        self.progress.completed()
    }

    pub fn is_cancelable(&self) -> bool {
        self.progress.cancelable()
    }

    /// Cause chain of a failed operation, most specific first. Empty while
    /// pending or after success.
    pub fn error_details(&self) -> Vec<ErrorDetail> {
        self.progress
            .error_info()
            .map(|info| info.to_details())
            .unwrap_or_default()
    }

    /// Terminal result, or `None` while the operation is still running.
    pub fn outcome(&self) -> Option<Result<()>> {
        if !self.progress.completed() {
            return None;
        }
        let code = self.progress.result_code().unwrap_or(result_code::S_OK);
        if !result_code::is_failure(code) {
            return Some(Ok(()));
        }

        let mut details = self.error_details();
        if details.is_empty() {
            details.push(ErrorDetail::new(
                format!("{} failed", self.description),
                code,
                "Progress",
                "",
            ));
        }
        Some(Err(OrchestratorError::BackendOperationFailed {
            code,
            message: details[0].message.clone(),
            details,
        }))
    }
}

/// Result of a non-blocking check.
#[derive(Debug)]
pub enum PollStatus {
    Pending { percent: u32 },
    Done(Result<()>),
}

impl PollStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, PollStatus::Done(_))
    }
}

/// Registry of in-flight progress handles. Clones share state.
#[derive(Clone)]
pub struct ProgressTracker {
    backend: Arc<dyn VirtualizationBackend>,
    handles: Arc<Mutex<HashMap<Uuid, ProgressHandle>>>,
    poll_interval: Duration,
    event_wait_ms: u64,
}

impl ProgressTracker {
    pub fn new(
        backend: Arc<dyn VirtualizationBackend>,
        poll_interval: Duration,
        event_wait_ms: u64,
    ) -> Self {
        Self {
            backend,
            handles: Arc::new(Mutex::new(HashMap::new())),
            poll_interval,
            event_wait_ms,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn track(&self, progress: Arc<dyn BackendProgress>, kind: ProgressKind) -> ProgressHandle {
        let handle = ProgressHandle {
            id: Uuid::new_v4(),
            kind,
            description: progress.description(),
            progress,
        };
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(handle.id, handle.clone());
        }
        debug!(progress_id = %handle.id, ?kind, description = %handle.description, "Tracking operation");
        handle
    }

    /// Non-blocking status check. Does not service backend events.
    ///
    /// A finished handle stops being tracked.
    pub fn poll(&self, handle: &ProgressHandle) -> PollStatus {
        match handle.outcome() {
            Some(result) => {
                self.forget(handle);
                PollStatus::Done(result)
            }
            None => PollStatus::Pending {
                percent: handle.percent(),
            },
        }
    }

    /// Waits until `handle` completes or `timeout` elapses.
    ///
    /// On timeout the operation keeps running and the handle can be awaited
    /// again. Handles that reach a terminal state stop being tracked. A
    /// timeout too large to represent as a deadline waits indefinitely.
    pub async fn await_completion(
        &self,
        handle: &ProgressHandle,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let PollStatus::Done(result) = self.poll(handle) {
                debug!(progress_id = %handle.id, success = result.is_ok(), "Operation finished");
                return result;
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                debug!(progress_id = %handle.id, timeout_ms = timeout.as_millis() as u64, "Operation timed out");
                return Err(OrchestratorError::Timeout {
                    operation: handle.description.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            self.backend.service_events(self.event_wait_ms)?;
            if handle.is_completed() {
                continue;
            }

            trace!(progress_id = %handle.id, percent = handle.percent(), "Waiting");
            let nap = match deadline {
                Some(deadline) => self.poll_interval.min(deadline - now),
                None => self.poll_interval,
            };
            tokio::time::sleep(nap).await;
        }
    }

    /// Requests cancellation. Returns `false` if the operation cannot be
    /// canceled; the handle must still be awaited either way.
    pub fn cancel(&self, handle: &ProgressHandle) -> bool {
        let accepted = handle.progress.cancel();
        debug!(progress_id = %handle.id, accepted, "Cancel requested");
        accepted
    }

    /// Tracked handles that have not completed.
    pub fn pending(&self) -> Vec<ProgressHandle> {
        self.handles
            .lock()
            .map(|handles| {
                handles
                    .values()
                    .filter(|h| !h.is_completed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stops tracking a handle. Returns whether it was tracked.
    pub fn forget(&self, handle: &ProgressHandle) -> bool {
        self.handles
            .lock()
            .map(|mut handles| handles.remove(&handle.id).is_some())
            .unwrap_or(false)
    }
}
