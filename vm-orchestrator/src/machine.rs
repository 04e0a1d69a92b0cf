//! Machine snapshots and the lifecycle state machine.

use serde::{Deserialize, Serialize};
use vm_core::{DeviceType, GraphicsController, LockMode, MachineId, MediumId, StorageBus};
use vm_provider::{MachineInfo, PowerState};

/// Lifecycle state of a machine as seen by the orchestrator.
///
/// A machine that is not in the registry is absent; there is no variant for it.
///
/// ```text
/// Provisioning → Registered → Starting → Running → Stopping → Registered
///                Registered ⇄ Locked(mode)
///                Registered → Destroying → (absent)
/// ```
///
/// Every transitional state can fall back to a settled one on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Created but not yet fully configured.
    Provisioning,
    /// Registered and powered off.
    Registered,
    /// Configuration lock held by at least one session.
    Locked(LockMode),
    Starting,
    Running,
    Stopping,
    Destroying,
}

impl MachineState {
    /// Not in the middle of an operation.
    pub fn is_settled(&self) -> bool {
        matches!(self, MachineState::Registered | MachineState::Running)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Running)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, MachineState::Registered)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, MachineState::Running)
    }

    pub fn can_transition_to(&self, target: MachineState) -> bool {
        use MachineState::*;
        matches!(
            (self, target),
            (Provisioning, Registered)
                | (Provisioning, Destroying)
                | (Registered, Locked(_))
                | (Registered, Starting)
                | (Registered, Destroying)
                | (Registered, Running)
                | (Locked(_), Registered)
                | (Locked(_), Locked(_))
                | (Locked(_), Destroying)
                | (Starting, Running)
                | (Starting, Registered)
                | (Running, Stopping)
                | (Running, Registered)
                | (Stopping, Registered)
                | (Stopping, Running)
                | (Destroying, Registered)
        )
    }

    /// Settled state for a machine discovered through the backend.
    pub fn from_power_state(power: PowerState) -> Self {
        match power {
            PowerState::Starting => MachineState::Starting,
            PowerState::Running => MachineState::Running,
            PowerState::Stopping => MachineState::Stopping,
            PowerState::PoweredOff | PowerState::Aborted => MachineState::Registered,
        }
    }

    /// Running while a VM process exists, otherwise registered.
    pub fn settled_from_power_state(power: PowerState) -> Self {
        if power.has_process() {
            MachineState::Running
        } else {
            MachineState::Registered
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Provisioning => "provisioning",
            MachineState::Registered => "registered",
            MachineState::Locked(LockMode::Write) => "locked(write)",
            MachineState::Locked(LockMode::Shared) => "locked(shared)",
            MachineState::Starting => "starting",
            MachineState::Running => "running",
            MachineState::Stopping => "stopping",
            MachineState::Destroying => "destroying",
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settings applied before a machine is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConfig {
    pub memory_mb: u64,
    pub vram_mb: u32,
    pub graphics: GraphicsController,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            vram_mb: 128,
            graphics: GraphicsController::Vmsvga,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub port: u32,
    pub device: u32,
    pub device_type: DeviceType,
    /// `None` for an empty drive.
    pub medium: Option<MediumId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageController {
    pub name: String,
    pub bus: StorageBus,
    pub attachments: Vec<Attachment>,
}

impl StorageController {
    pub fn slot(&self, port: u32, device: u32) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.port == port && a.device == device)
    }
}

/// Snapshot of a machine known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub os_type: String,
    pub memory_mb: u64,
    pub vram_mb: u32,
    pub graphics: GraphicsController,
    /// Boot slots, 1-based on the backend; index 0 here is slot 1.
    pub boot_order: Vec<Option<DeviceType>>,
    pub controllers: Vec<StorageController>,
    pub state: MachineState,
}

impl Machine {
    pub(crate) fn from_info(info: &MachineInfo, state: MachineState) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            os_type: info.os_type.clone(),
            memory_mb: info.memory_mb,
            vram_mb: info.vram_mb,
            graphics: info.graphics,
            boot_order: Vec::new(),
            controllers: Vec::new(),
            state,
        }
    }

    pub fn controller(&self, name: &str) -> Option<&StorageController> {
        self.controllers.iter().find(|c| c.name == name)
    }

    pub(crate) fn controller_mut(&mut self, name: &str) -> Option<&mut StorageController> {
        self.controllers.iter_mut().find(|c| c.name == name)
    }

    /// Media attached to any controller.
    pub fn attached_media(&self) -> Vec<MediumId> {
        self.controllers
            .iter()
            .flat_map(|c| c.attachments.iter().filter_map(|a| a.medium))
            .collect()
    }
}
