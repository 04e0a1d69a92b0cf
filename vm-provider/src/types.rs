//! Plain data exchanged with a virtualization backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use vm_core::{AccessMode, DeviceType, GraphicsController, MachineId, MediumId};

/// Power state of a machine as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    PoweredOff,
    Starting,
    Running,
    Stopping,
    Aborted,
}

impl PowerState {
    pub fn is_running(&self) -> bool {
        matches!(self, PowerState::Running)
    }

    /// A VM process exists for the machine.
    pub fn has_process(&self) -> bool {
        matches!(
            self,
            PowerState::Starting | PowerState::Running | PowerState::Stopping
        )
    }
}

/// Snapshot of a machine's backend-side state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub name: String,
    pub os_type: String,
    pub memory_mb: u64,
    pub vram_mb: u32,
    pub graphics: GraphicsController,
    pub registered: bool,
    pub power_state: PowerState,
}

/// Snapshot of a medium known to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediumInfo {
    pub id: MediumId,
    /// File name portion of the location.
    pub name: String,
    pub location: String,
    pub description: String,
    pub format: String,
    pub device_type: DeviceType,
    pub access_mode: AccessMode,
    pub logical_size: u64,
}

/// Settings applied to a machine before it is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseSettings {
    pub memory_mb: u64,
    pub os_type: String,
    pub vram_mb: u32,
    pub graphics: GraphicsController,
}

/// Flags accepted by `create_machine`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateFlags {
    /// Replace a stale settings file left behind by an earlier machine.
    pub force_overwrite: bool,
    pub groups: Vec<String>,
}

impl CreateFlags {
    /// Renders flags in the backend's `key=value,...` form.
    pub fn to_flag_string(&self) -> String {
        if self.force_overwrite {
            "forceOverwrite=1".to_string()
        } else {
            String::new()
        }
    }
}

/// Guest operating system profile offered by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestOsType {
    pub id: String,
    pub description: String,
    pub family: String,
    pub recommended_memory_mb: u64,
    pub is_64_bit: bool,
}

/// Login for the backend endpoint.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_create_flags_string() {
        assert_eq!(CreateFlags::default().to_flag_string(), "");
        let flags = CreateFlags {
            force_overwrite: true,
            ..Default::default()
        };
        assert_eq!(flags.to_flag_string(), "forceOverwrite=1");
    }

    #[test]
    fn test_power_state_process() {
        assert!(PowerState::Running.has_process());
        assert!(PowerState::Stopping.has_process());
        assert!(!PowerState::PoweredOff.has_process());
        assert!(!PowerState::Aborted.is_running());
    }
}
