use std::sync::Mutex;

use vm_core::error::result_code;

use crate::progress::{BackendProgress, ErrorInfo};

use super::store::Store;

/// Mutation applied to the simulated store when an operation settles.
pub(super) type Effect = Box<dyn FnOnce(&mut Store) + Send>;

/// What `service_events` should do with a pending operation on this tick.
pub(super) enum Step {
    Pending,
    Ready,
    Canceled,
}

#[derive(Debug)]
struct ProgressState {
    /// Ticks left before completion; `None` never completes.
    remaining: Option<u32>,
    total: u32,
    completed: bool,
    cancel_requested: bool,
    result_code: Option<i32>,
    error: Option<ErrorInfo>,
}

/// Progress object handed out by the simulated backend.
#[derive(Debug)]
pub struct SimulatedProgress {
    description: String,
    cancelable: bool,
    state: Mutex<ProgressState>,
}

impl SimulatedProgress {
    pub(super) fn new(description: impl Into<String>, latency: Option<u32>, cancelable: bool) -> Self {
        Self {
            description: description.into(),
            cancelable,
            state: Mutex::new(ProgressState {
                remaining: latency,
                total: latency.unwrap_or(0),
                completed: false,
                cancel_requested: false,
                result_code: None,
                error: None,
            }),
        }
    }

    pub(super) fn step(&self) -> Step {
        let Ok(mut state) = self.state.lock() else {
            return Step::Pending;
        };
        if state.completed {
            return Step::Pending;
        }
        if state.cancel_requested {
            return Step::Canceled;
        }
        match state.remaining {
            None => Step::Pending,
            Some(0) => Step::Ready,
            Some(n) => {
                state.remaining = Some(n - 1);
                Step::Pending
            }
        }
    }

    pub(super) fn finish(&self, outcome: std::result::Result<(), ErrorInfo>) {
        if let Ok(mut state) = self.state.lock() {
            state.completed = true;
            match outcome {
                Ok(()) => state.result_code = Some(result_code::S_OK),
                Err(info) => {
                    state.result_code = Some(info.result_code);
                    state.error = Some(info);
                }
            }
        }
    }
}

impl BackendProgress for SimulatedProgress {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn completed(&self) -> bool {
        self.state.lock().map(|s| s.completed).unwrap_or(false)
    }

    fn percent(&self) -> u32 {
        let Ok(state) = self.state.lock() else {
            return 0;
        };
        if state.completed {
            return 100;
        }
        match state.remaining {
            Some(remaining) if state.total > 0 => (state.total - remaining) * 100 / (state.total + 1),
            _ => 0,
        }
    }

    fn result_code(&self) -> Option<i32> {
        self.state.lock().ok().and_then(|s| s.result_code)
    }

    fn error_info(&self) -> Option<ErrorInfo> {
        self.state.lock().ok().and_then(|s| s.error.clone())
    }

    fn cancelable(&self) -> bool {
        self.cancelable
    }

    fn cancel(&self) -> bool {
        if !self.cancelable {
            return false;
        }
        match self.state.lock() {
            Ok(mut state) if !state.completed => {
                state.cancel_requested = true;
                true
            }
            _ => false,
        }
    }
}

/// An in-flight operation together with its planned outcome.
pub(super) struct PendingOp {
    pub progress: std::sync::Arc<SimulatedProgress>,
    pub failure: Option<ErrorInfo>,
    pub on_success: Effect,
    pub on_abort: Effect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_counts_down_latency() {
        let progress = SimulatedProgress::new("op", Some(2), false);
        assert!(matches!(progress.step(), Step::Pending));
        assert!(matches!(progress.step(), Step::Pending));
        assert!(matches!(progress.step(), Step::Ready));
    }

    #[test]
    fn test_hanging_progress_never_ready() {
        let progress = SimulatedProgress::new("op", None, false);
        for _ in 0..100 {
            assert!(matches!(progress.step(), Step::Pending));
        }
        assert_eq!(progress.percent(), 0);
    }

    #[test]
    fn test_cancel_only_when_cancelable() {
        let fixed = SimulatedProgress::new("op", Some(1), false);
        assert!(!fixed.cancel());

        let cancelable = SimulatedProgress::new("op", Some(1), true);
        assert!(cancelable.cancel());
        assert!(matches!(cancelable.step(), Step::Canceled));
    }

    #[test]
    fn test_finish_records_error() {
        let progress = SimulatedProgress::new("op", Some(0), false);
        progress.finish(Err(ErrorInfo::new("boom", result_code::E_FAIL, "Test", "")));
        assert!(progress.completed());
        assert_eq!(progress.percent(), 100);
        assert_eq!(progress.result_code(), Some(result_code::E_FAIL));
        assert_eq!(progress.error_info().unwrap().text, "boom");
    }
}
