use std::collections::{HashMap, HashSet};

use vm_core::error::result_code;
use vm_core::{
    AccessMode, DeviceType, GraphicsController, LockMode, MachineId, MediumId, SessionId,
    StorageBus,
};

use crate::error::{ProviderError, Result};
use crate::progress::ErrorInfo;
use crate::types::{MachineInfo, MediumInfo, PowerState};

use super::progress::{PendingOp, Step};

pub(super) const BOOT_SLOTS: usize = 4;

#[derive(Debug, Clone)]
pub(super) struct SimController {
    pub name: String,
    pub bus: StorageBus,
}

#[derive(Debug, Clone)]
pub(super) struct SimAttachment {
    pub controller: String,
    pub port: u32,
    pub device: u32,
    pub device_type: DeviceType,
    pub medium: Option<MediumId>,
}

#[derive(Debug)]
pub(super) struct SimMachine {
    pub id: MachineId,
    pub name: String,
    pub os_type: String,
    pub memory_mb: u64,
    pub vram_mb: u32,
    pub graphics: GraphicsController,
    pub registered: bool,
    pub power_state: PowerState,
    pub controllers: Vec<SimController>,
    pub attachments: Vec<SimAttachment>,
    pub boot_order: [Option<DeviceType>; BOOT_SLOTS],
    pub write_holder: Option<SessionId>,
    pub shared_holders: HashSet<SessionId>,
    pub saved: bool,
}

impl SimMachine {
    pub fn new(name: &str, os_type: &str) -> Self {
        Self {
            id: MachineId::new(),
            name: name.to_string(),
            os_type: os_type.to_string(),
            memory_mb: 128,
            vram_mb: 16,
            graphics: GraphicsController::VboxVga,
            registered: false,
            power_state: PowerState::PoweredOff,
            controllers: Vec::new(),
            attachments: Vec::new(),
            boot_order: [
                Some(DeviceType::Floppy),
                Some(DeviceType::Dvd),
                Some(DeviceType::HardDisk),
                None,
            ],
            write_holder: None,
            shared_holders: HashSet::new(),
            saved: false,
        }
    }

    pub fn info(&self) -> MachineInfo {
        MachineInfo {
            id: self.id,
            name: self.name.clone(),
            os_type: self.os_type.clone(),
            memory_mb: self.memory_mb,
            vram_mb: self.vram_mb,
            graphics: self.graphics,
            registered: self.registered,
            power_state: self.power_state,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.write_holder.is_some() || !self.shared_holders.is_empty()
    }
}

#[derive(Debug)]
pub(super) struct SimMedium {
    pub info: MediumInfo,
    pub storage_created: bool,
    pub attached_to: Option<MachineId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SessionBinding {
    Idle,
    Locked(MachineId, LockMode),
    /// Session bound to a VM process it spawned.
    Launch(MachineId),
}

#[derive(Default)]
pub(super) struct Store {
    pub connected: bool,
    pub machines: HashMap<MachineId, SimMachine>,
    pub media: HashMap<MediumId, SimMedium>,
    pub sessions: HashMap<SessionId, SessionBinding>,
    /// Image files that exist on the simulated host.
    pub files: HashMap<String, u64>,
    pub pending: Vec<PendingOp>,
}

impl Store {
    pub fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(ProviderError::NotConnected)
        }
    }

    pub fn machine(&self, id: &MachineId) -> Result<&SimMachine> {
        self.machines
            .get(id)
            .ok_or_else(|| ProviderError::ObjectNotFound(format!("machine {id}")))
    }

    pub fn machine_mut(&mut self, id: &MachineId) -> Result<&mut SimMachine> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| ProviderError::ObjectNotFound(format!("machine {id}")))
    }

    pub fn registered_by_name(&self, name: &str) -> Option<&SimMachine> {
        self.machines
            .values()
            .find(|m| m.registered && m.name == name)
    }

    /// Drops `session` from the lock holders of `machine`.
    pub fn release_holder(&mut self, machine: &MachineId, session: &SessionId) {
        if let Some(m) = self.machines.get_mut(machine) {
            if m.write_holder == Some(*session) {
                m.write_holder = None;
            }
            m.shared_holders.remove(session);
        }
    }

    pub fn binding(&self, session: &SessionId) -> Result<SessionBinding> {
        self.sessions
            .get(session)
            .copied()
            .ok_or_else(|| ProviderError::ObjectNotFound(format!("session {session}")))
    }

    /// Resolves the machine a session holds for writing.
    pub fn write_session_machine(&mut self, session: &SessionId) -> Result<&mut SimMachine> {
        match self.binding(session)? {
            SessionBinding::Locked(machine, LockMode::Write) => self.machine_mut(&machine),
            _ => Err(ProviderError::InvalidObjectState(format!(
                "session {session} does not hold a write lock"
            ))),
        }
    }

    pub fn medium(&self, id: &MediumId) -> Result<&SimMedium> {
        self.media
            .get(id)
            .ok_or_else(|| ProviderError::ObjectNotFound(format!("medium {id}")))
    }

    pub fn medium_by_location(&self, location: &str) -> Option<&SimMedium> {
        self.media.values().find(|m| m.info.location == location)
    }

    /// Advances every pending operation by one tick, settling finished ones.
    pub fn service(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let mut still_running = Vec::with_capacity(pending.len());

        for op in pending {
            match op.progress.step() {
                Step::Pending => still_running.push(op),
                Step::Canceled => {
                    (op.on_abort)(self);
                    op.progress.finish(Err(ErrorInfo::new(
                        "Operation was canceled by the user",
                        result_code::E_ABORT,
                        "ProgressWrap",
                        "",
                    )));
                }
                Step::Ready => match op.failure {
                    None => {
                        (op.on_success)(self);
                        op.progress.finish(Ok(()));
                    }
                    Some(info) => {
                        (op.on_abort)(self);
                        op.progress.finish(Err(info));
                    }
                },
            }
        }

        // Operations queued by effects land in `self.pending`; keep them.
        still_running.append(&mut self.pending);
        self.pending = still_running;
    }
}

pub(super) fn file_name(location: &str) -> String {
    location
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(location)
        .to_string()
}

pub(super) fn new_medium(
    location: &str,
    format: &str,
    device_type: DeviceType,
    access_mode: AccessMode,
    logical_size: u64,
) -> MediumInfo {
    MediumInfo {
        id: MediumId::new(),
        name: file_name(location),
        location: location.to_string(),
        description: String::new(),
        format: format.to_string(),
        device_type,
        access_mode,
        logical_size,
    }
}
