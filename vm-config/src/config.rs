//! Orchestrator-wide settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use vm_core::CleanupMode;

pub const DEFAULT_ENDPOINT: &str = "sim://local";

/// Root structure of `orchestrator.yaml`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Backend endpoint URL (`sim://local`, `http://host:18083`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Delay between two progress polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long one `service_events` call may block.
    #[serde(default)]
    pub event_wait_ms: u64,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Retry policy for write-lock acquisition.
    #[serde(default)]
    pub lock_retry: RetrySettings,

    /// Media handed back when a machine is destroyed.
    #[serde(default)]
    pub cleanup_mode: CleanupMode,

    /// `KEY=value` pairs passed to launched VM processes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub launch_env: Vec<String>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            user: None,
            password: None,
            poll_interval_ms: default_poll_interval_ms(),
            event_wait_ms: 0,
            timeouts: TimeoutSettings::default(),
            lock_retry: RetrySettings::default(),
            cleanup_mode: CleanupMode::default(),
            launch_env: Vec::new(),
        }
    }
}

impl fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("event_wait_ms", &self.event_wait_ms)
            .field("timeouts", &self.timeouts)
            .field("lock_retry", &self.lock_retry)
            .field("cleanup_mode", &self.cleanup_mode)
            .field("launch_env", &self.launch_env)
            .finish()
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Applies `VM_ORCH_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> vm_core::Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup, mainly for tests.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> vm_core::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("VM_ORCH_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(user) = lookup("VM_ORCH_USER") {
            self.user = Some(user);
        }
        if let Some(password) = lookup("VM_ORCH_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(raw) = lookup("VM_ORCH_POLL_INTERVAL_MS") {
            self.poll_interval_ms = raw.trim().parse().map_err(|_| {
                vm_core::VmError::Config(format!(
                    "VM_ORCH_POLL_INTERVAL_MS must be a number of milliseconds, got '{}'",
                    raw
                ))
            })?;
        }
        Ok(())
    }
}

/// Upper bounds for the asynchronous steps of lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_create_storage_ms")]
    pub create_storage_ms: u64,

    #[serde(default = "default_start_ms")]
    pub start_ms: u64,

    /// Used when a stop is requested without an explicit timeout.
    #[serde(default = "default_stop_ms")]
    pub stop_ms: u64,
}

fn default_create_storage_ms() -> u64 {
    600_000
}

fn default_start_ms() -> u64 {
    120_000
}

fn default_stop_ms() -> u64 {
    10_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            create_storage_ms: default_create_storage_ms(),
            start_ms: default_start_ms(),
            stop_ms: default_stop_ms(),
        }
    }
}

impl TimeoutSettings {
    pub fn create_storage(&self) -> Duration {
        Duration::from_millis(self.create_storage_ms)
    }

    pub fn start(&self) -> Duration {
        Duration::from_millis(self.start_ms)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_millis(self.stop_ms)
    }
}

/// Retry policy applied when the backend refuses a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay; attempt `n` waits `n * backoff_ms`.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    250
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}
