//! Name-indexed view of the machines the orchestrator manages.
//!
//! Machines are keyed by name. Lookups that miss locally fall back to the
//! backend and adopt what they find, so machines created by other clients can
//! still be started, stopped and destroyed. Configuration changes go through
//! here and require a live write [`SessionHandle`] for the machine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};
use vm_core::{
    AccessMode, CleanupMode, DeviceType, LockMode, MachineId, MediumId, MediumVariant, StorageBus,
};
use vm_provider::{
    BackendProgress, BaseSettings, CreateFlags, ProviderError, VirtualizationBackend,
};

use crate::error::{OrchestratorError, Result};
use crate::machine::{Attachment, BaseConfig, Machine, MachineState, StorageController};
use crate::media::{MediaCatalog, MediumAttachment, StorageMedium};
use crate::operation::OperationType;
use crate::session::SessionHandle;

struct MachineRecord {
    machine: Machine,
    /// Composite operation currently working on this machine.
    active: Option<OperationType>,
}

/// Media left behind by an `unregister` whose `delete_config` has not succeeded.
#[derive(Debug, Clone)]
struct PendingCleanup {
    machine: MachineId,
    media: Vec<StorageMedium>,
}

#[derive(Default)]
struct RegistryInner {
    machines: HashMap<String, MachineRecord>,
    catalog: MediaCatalog,
    pending_cleanup: HashMap<String, PendingCleanup>,
}

impl RegistryInner {
    fn record_by_id(&self, id: &MachineId) -> Result<&MachineRecord> {
        self.machines
            .values()
            .find(|r| &r.machine.id == id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("machine {}", id)))
    }

    fn record_by_id_mut(&mut self, id: &MachineId) -> Result<&mut MachineRecord> {
        self.machines
            .values_mut()
            .find(|r| &r.machine.id == id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("machine {}", id)))
    }
}

#[derive(Clone)]
pub struct MachineRegistry {
    backend: Arc<dyn VirtualizationBackend>,
    inner: Arc<RwLock<RegistryInner>>,
}

fn require_write(handle: &SessionHandle, machine: &MachineId) -> Result<()> {
    if handle.is_live_writer_for(machine) {
        Ok(())
    } else {
        Err(OrchestratorError::LockRequired(format!(
            "changing '{}' needs a live write lock (handle is {}, {})",
            handle.machine_name(),
            handle.mode(),
            if handle.is_live() { "live" } else { "released" }
        )))
    }
}

impl MachineRegistry {
    pub fn new(backend: Arc<dyn VirtualizationBackend>) -> Self {
        Self {
            backend,
            inner: Arc::new(RwLock::new(RegistryInner::default())),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryInner>> {
        self.inner
            .read()
            .map_err(|_| OrchestratorError::InvalidState("machine registry poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|_| OrchestratorError::InvalidState("machine registry poisoned".to_string()))
    }

    /// Creates an unregistered machine with `config` applied.
    ///
    /// The new entry starts in `Provisioning` with a provision marked active;
    /// callers clear the marker with [`MachineRegistry::end_operation`].
    pub fn create(&self, name: &str, os_type: &str, config: &BaseConfig) -> Result<Machine> {
        let mut inner = self.write()?;
        if inner.machines.contains_key(name) {
            return Err(OrchestratorError::DuplicateName(format!(
                "a machine named '{}' is already known",
                name
            )));
        }

        let flags = CreateFlags {
            force_overwrite: true,
            ..Default::default()
        };
        let info = self.backend.create_machine(name, os_type, &flags)?;
        let settings = BaseSettings {
            memory_mb: config.memory_mb,
            os_type: os_type.to_string(),
            vram_mb: config.vram_mb,
            graphics: config.graphics,
        };
        if let Err(e) = self.backend.set_base_settings(&info.id, &settings) {
            if let Err(cleanup) = self.backend.delete_config(&info.id, &[]) {
                warn!(machine = %name, error = %cleanup, "Could not discard machine object");
            }
            return Err(e.into());
        }

        let mut machine = Machine::from_info(&info, MachineState::Provisioning);
        machine.memory_mb = config.memory_mb;
        machine.vram_mb = config.vram_mb;
        machine.graphics = config.graphics;

        inner.machines.insert(
            name.to_string(),
            MachineRecord {
                machine: machine.clone(),
                active: Some(OperationType::Provision),
            },
        );
        info!(machine = %name, id = %machine.id, os_type, "Machine created");
        Ok(machine)
    }

    pub fn register(&self, id: &MachineId) -> Result<Machine> {
        self.backend.register_machine(id)?;
        let mut inner = self.write()?;
        let record = inner.record_by_id_mut(id)?;
        record.machine.state = MachineState::Registered;
        Ok(record.machine.clone())
    }

    /// Drops an entry that never got registered.
    pub fn discard(&self, id: &MachineId) -> Result<()> {
        {
            let mut inner = self.write()?;
            let name = inner.record_by_id(id)?.machine.name.clone();
            inner.machines.remove(&name);
        }
        if let Err(e) = self.backend.delete_config(id, &[]) {
            warn!(%id, error = %e, "Could not delete settings of discarded machine");
        }
        Ok(())
    }

    /// Finds a machine by name, adopting it from the backend if needed.
    ///
    /// Settled entries with no operation running are checked against the
    /// backend first, since other clients may have started, stopped or
    /// removed the machine. Entries the backend no longer knows are dropped.
    pub fn find(&self, name: &str) -> Result<Machine> {
        let cached = {
            let inner = self.read()?;
            match inner.machines.get(name) {
                Some(record) if record.active.is_some() || !record.machine.state.is_settled() => {
                    return Ok(record.machine.clone());
                }
                Some(record) => Some(record.machine.id),
                None => None,
            }
        };

        match self.backend.find_machine(name) {
            Ok(info) => {
                let mut inner = self.write()?;
                let record = inner
                    .machines
                    .entry(name.to_string())
                    .or_insert_with(|| {
                        debug!(machine = %name, "Adopted machine from backend");
                        MachineRecord {
                            machine: Machine::from_info(
                                &info,
                                MachineState::from_power_state(info.power_state),
                            ),
                            active: None,
                        }
                    });
                if record.active.is_none() && record.machine.state.is_settled() {
                    if record.machine.id != info.id {
                        debug!(machine = %name, id = %info.id, "Machine was replaced by another client");
                        record.machine = Machine::from_info(
                            &info,
                            MachineState::settled_from_power_state(info.power_state),
                        );
                    } else {
                        record.machine.state = MachineState::settled_from_power_state(info.power_state);
                        record.machine.memory_mb = info.memory_mb;
                        record.machine.os_type = info.os_type.clone();
                    }
                }
                Ok(record.machine.clone())
            }
            Err(ProviderError::ObjectNotFound(_)) => {
                if let Some(id) = cached {
                    self.evict(name, &id)?;
                }
                Err(OrchestratorError::NotFound(format!(
                    "no machine named '{}'",
                    name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drops the entry for a machine that is gone from the backend.
    pub(crate) fn evict(&self, name: &str, id: &MachineId) -> Result<()> {
        let mut inner = self.write()?;
        if inner
            .machines
            .get(name)
            .is_some_and(|record| &record.machine.id == id)
        {
            inner.machines.remove(name);
            inner.catalog.detach_machine(id);
            debug!(machine = %name, %id, "Machine disappeared from backend");
        }
        Ok(())
    }

    pub fn get(&self, id: &MachineId) -> Result<Machine> {
        Ok(self.read()?.record_by_id(id)?.machine.clone())
    }

    /// Known machines, sorted by name.
    pub fn list(&self) -> Result<Vec<Machine>> {
        let inner = self.read()?;
        let mut machines: Vec<Machine> =
            inner.machines.values().map(|r| r.machine.clone()).collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(machines)
    }

    /// Reconciles with the backend's list of registered machines.
    ///
    /// Machines busy with an operation are left untouched.
    pub fn refresh(&self) -> Result<Vec<Machine>> {
        let infos = self.backend.list_machines()?;
        {
            let mut inner = self.write()?;
            inner.machines.retain(|name, record| {
                let keep = record.active.is_some()
                    || !record.machine.state.is_settled()
                    || infos.iter().any(|i| i.id == record.machine.id);
                if !keep {
                    debug!(machine = %name, "Machine disappeared from backend");
                }
                keep
            });

            for info in &infos {
                match inner.machines.get_mut(&info.name) {
                    Some(record) if record.active.is_none() && record.machine.state.is_settled() => {
                        record.machine.state = MachineState::settled_from_power_state(info.power_state);
                        record.machine.memory_mb = info.memory_mb;
                        record.machine.os_type = info.os_type.clone();
                    }
                    Some(_) => {}
                    None => {
                        inner.machines.insert(
                            info.name.clone(),
                            MachineRecord {
                                machine: Machine::from_info(
                                    info,
                                    MachineState::from_power_state(info.power_state),
                                ),
                                active: None,
                            },
                        );
                    }
                }
            }
        }
        self.list()
    }

    pub fn active_operation(&self, name: &str) -> Option<OperationType> {
        self.read()
            .ok()
            .and_then(|inner| inner.machines.get(name).and_then(|r| r.active))
    }

    /// Marks `operation` as working on `name`. Fails if another one already is.
    pub fn begin_operation(&self, name: &str, operation: OperationType) -> Result<()> {
        let mut inner = self.write()?;
        let record = inner
            .machines
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("no machine named '{}'", name)))?;
        if let Some(current) = record.active {
            return Err(OrchestratorError::InvalidState(format!(
                "'{}' is busy with {}",
                name,
                current.as_str()
            )));
        }
        record.active = Some(operation);
        Ok(())
    }

    pub fn end_operation(&self, name: &str) {
        if let Ok(mut inner) = self.write() {
            if let Some(record) = inner.machines.get_mut(name) {
                record.active = None;
            }
        }
    }

    /// Moves a machine to `state`, rejecting transitions the state machine forbids.
    pub fn set_state(&self, id: &MachineId, state: MachineState) -> Result<()> {
        let mut inner = self.write()?;
        let record = inner.record_by_id_mut(id)?;
        let current = record.machine.state;
        if current == state {
            return Ok(());
        }
        if !current.can_transition_to(state) {
            return Err(OrchestratorError::InvalidState(format!(
                "'{}' cannot go from {} to {}",
                record.machine.name, current, state
            )));
        }
        debug!(machine = %record.machine.name, from = %current, to = %state, "State change");
        record.machine.state = state;
        Ok(())
    }

    pub(crate) fn note_locked(&self, id: &MachineId, mode: LockMode) -> Result<()> {
        let mut inner = self.write()?;
        let record = inner.record_by_id_mut(id)?;
        if matches!(
            record.machine.state,
            MachineState::Registered | MachineState::Locked(_)
        ) {
            record.machine.state = MachineState::Locked(mode);
        }
        Ok(())
    }

    pub(crate) fn note_unlocked(&self, id: &MachineId) -> Result<()> {
        let mut inner = self.write()?;
        if let Ok(record) = inner.record_by_id_mut(id) {
            if matches!(record.machine.state, MachineState::Locked(_)) {
                record.machine.state = MachineState::Registered;
            }
        }
        Ok(())
    }

    /// Unregisters a machine and returns the media `mode` hands back.
    ///
    /// Storage is not deleted. The returned media stay listed under
    /// [`MachineRegistry::pending_cleanup`] until `delete_config` succeeds.
    pub fn unregister(&self, id: &MachineId, mode: CleanupMode) -> Result<Vec<StorageMedium>> {
        let name = self.get(id)?.name;
        let infos = self.backend.unregister_machine(id, mode)?;

        let mut inner = self.write()?;
        inner.machines.remove(&name);
        inner.catalog.detach_machine(id);
        let media: Vec<StorageMedium> = infos.iter().map(|i| inner.catalog.upsert(i)).collect();
        inner.pending_cleanup.insert(
            name.clone(),
            PendingCleanup {
                machine: *id,
                media: media.clone(),
            },
        );
        info!(machine = %name, ?mode, media = media.len(), "Machine unregistered");
        Ok(media)
    }

    /// Deletes the settings of an unregistered machine and the storage of `media`.
    pub fn delete_config(&self, id: &MachineId, media: &[StorageMedium]) -> Result<()> {
        let ids: Vec<MediumId> = media.iter().map(|m| m.id).collect();
        self.backend.delete_config(id, &ids)?;

        let mut inner = self.write()?;
        for medium in media {
            inner.catalog.remove(&medium.id);
        }
        inner.pending_cleanup.retain(|_, p| &p.machine != id);
        debug!(%id, media = ids.len(), "Machine settings deleted");
        Ok(())
    }

    /// Media waiting for `delete_config` after `name` was unregistered.
    pub fn pending_cleanup(&self, name: &str) -> Option<Vec<StorageMedium>> {
        self.read()
            .ok()
            .and_then(|inner| inner.pending_cleanup.get(name).map(|p| p.media.clone()))
    }

    /// Retries a pending `delete_config` for `name`; returns the media removed.
    pub fn retry_cleanup(&self, name: &str) -> Result<Vec<StorageMedium>> {
        let pending = self.read()?.pending_cleanup.get(name).cloned();
        match pending {
            Some(p) => {
                info!(machine = %name, media = p.media.len(), "Retrying cleanup");
                self.delete_config(&p.machine, &p.media)?;
                Ok(p.media)
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn add_storage_controller(
        &self,
        handle: &SessionHandle,
        name: &str,
        bus: StorageBus,
    ) -> Result<()> {
        let id = *handle.machine_id();
        require_write(handle, &id)?;
        self.backend
            .add_storage_controller(handle.session_id(), name, bus)?;

        let mut inner = self.write()?;
        inner
            .record_by_id_mut(&id)?
            .machine
            .controllers
            .push(StorageController {
                name: name.to_string(),
                bus,
                attachments: Vec::new(),
            });
        Ok(())
    }

    pub fn attach_device(
        &self,
        handle: &SessionHandle,
        controller: &str,
        port: u32,
        device: u32,
        device_type: DeviceType,
        medium: Option<&MediumId>,
    ) -> Result<()> {
        let id = *handle.machine_id();
        require_write(handle, &id)?;
        if let Some(medium) = medium {
            self.read()?.catalog.check_attachable(medium)?;
        }

        self.backend.attach_device(
            handle.session_id(),
            controller,
            port,
            device,
            device_type,
            medium,
        )?;

        let mut inner = self.write()?;
        if let Some(medium) = medium {
            inner.catalog.attach(
                medium,
                MediumAttachment {
                    machine: id,
                    controller: controller.to_string(),
                    port,
                    device,
                },
            )?;
        }
        let record = inner.record_by_id_mut(&id)?;
        if let Some(ctl) = record.machine.controller_mut(controller) {
            ctl.attachments.push(Attachment {
                port,
                device,
                device_type,
                medium: medium.copied(),
            });
        }
        Ok(())
    }

    /// Sets boot slot `position` (1-based).
    pub fn set_boot_order(
        &self,
        handle: &SessionHandle,
        position: u32,
        device_type: Option<DeviceType>,
    ) -> Result<()> {
        let id = *handle.machine_id();
        require_write(handle, &id)?;
        self.backend
            .set_boot_order(handle.session_id(), position, device_type)?;

        let mut inner = self.write()?;
        let boot_order = &mut inner.record_by_id_mut(&id)?.machine.boot_order;
        let slot = position.saturating_sub(1) as usize;
        if boot_order.len() <= slot {
            boot_order.resize(slot + 1, None);
        }
        boot_order[slot] = device_type;
        Ok(())
    }

    pub fn set_memory_size(&self, handle: &SessionHandle, memory_mb: u64) -> Result<()> {
        let id = *handle.machine_id();
        require_write(handle, &id)?;
        self.backend.set_memory_size(handle.session_id(), memory_mb)?;
        self.write()?.record_by_id_mut(&id)?.machine.memory_mb = memory_mb;
        Ok(())
    }

    pub fn save_settings(&self, handle: &SessionHandle) -> Result<()> {
        require_write(handle, handle.machine_id())?;
        self.backend.save_settings(handle.session_id())?;
        Ok(())
    }

    /// Opens an existing image on the backend host.
    pub fn open_medium(
        &self,
        location: &str,
        kind: DeviceType,
        access: AccessMode,
    ) -> Result<StorageMedium> {
        let info = self.backend.open_medium(location, kind, access, false)?;
        Ok(self.write()?.catalog.upsert(&info))
    }

    /// Creates a medium object; its storage is allocated by `create_base_storage`.
    pub fn create_medium(
        &self,
        format: &str,
        location: &str,
        kind: DeviceType,
    ) -> Result<StorageMedium> {
        let info = self
            .backend
            .create_medium(format, location, AccessMode::ReadWrite, kind)?;
        Ok(self.write()?.catalog.upsert(&info))
    }

    pub fn create_base_storage(
        &self,
        medium: &MediumId,
        size_bytes: u64,
        variant: MediumVariant,
    ) -> Result<Arc<dyn BackendProgress>> {
        Ok(self
            .backend
            .create_base_storage(medium, size_bytes, variant)?)
    }

    pub fn mark_storage_created(&self, medium: &MediumId, size_bytes: u64) -> Result<()> {
        self.write()?.catalog.set_logical_size(medium, size_bytes);
        Ok(())
    }

    pub fn medium(&self, id: &MediumId) -> Option<StorageMedium> {
        self.read().ok().and_then(|inner| inner.catalog.get(id).cloned())
    }

    pub fn media(&self) -> Vec<StorageMedium> {
        self.read()
            .map(|inner| inner.catalog.list())
            .unwrap_or_default()
    }
}
