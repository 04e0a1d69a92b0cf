//! In-process simulated hypervisor.
//!
//! `SimulatedBackend` keeps machines, media and sessions in memory and applies
//! the same locking rules a real hypervisor enforces: one write session per
//! machine, shared sessions only without a writer, and no write session while
//! a VM process runs. Asynchronous operations only make progress when
//! [`VirtualizationBackend::service_events`] is called, which mirrors backends
//! that deliver completion through an event queue the client must pump.
//!
//! Faults can be queued per call site to exercise error paths.

mod faults;
mod progress;
mod store;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use vm_core::error::{result_code, ErrorDetail};
use vm_core::{
    AccessMode, CleanupMode, DeviceType, LaunchMode, LockMode, MachineId, MediumId, MediumVariant,
    SessionId, StorageBus,
};

use crate::endpoint::BackendEndpoint;
use crate::error::{ProviderError, Result};
use crate::progress::{BackendProgress, ErrorInfo};
use crate::types::{
    BaseSettings, CreateFlags, Credentials, GuestOsType, MachineInfo, MediumInfo, PowerState,
};
use crate::VirtualizationBackend;

pub use faults::{Fault, FaultPoint};
pub use progress::SimulatedProgress;

use faults::FaultPlan;
use progress::{Effect, PendingOp};
use store::{
    new_medium, SessionBinding, SimAttachment, SimController, SimMachine, SimMedium, Store,
    BOOT_SLOTS,
};

const VERSION: &str = "7.0.0_SIMULATED";
const MIN_MEMORY_MB: u64 = 4;
const MAX_MEMORY_MB: u64 = 2_097_152;
const DEFAULT_LATENCY: u32 = 1;

struct SimState {
    store: Store,
    faults: FaultPlan,
    latency: u32,
    reachable: bool,
    required_credentials: Option<Credentials>,
}

/// Thread-safe in-memory backend. Clones share the same simulated host.
#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                store: Store::default(),
                faults: FaultPlan::default(),
                latency: DEFAULT_LATENCY,
                reachable: true,
                required_credentials: None,
            })),
        }
    }

    /// Number of extra `service_events` calls an operation needs before completing.
    pub fn with_latency(self, ticks: u32) -> Self {
        self.set_latency(ticks);
        self
    }

    /// Applies to operations started after the call.
    pub fn set_latency(&self, ticks: u32) {
        if let Ok(mut state) = self.inner.lock() {
            state.latency = ticks;
        }
    }

    /// Rejects `connect` unless these credentials are presented.
    pub fn require_credentials(&self, credentials: Credentials) {
        if let Ok(mut state) = self.inner.lock() {
            state.required_credentials = Some(credentials);
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.reachable = reachable;
        }
    }

    /// Places an image file on the simulated host so `open_medium` can find it.
    pub fn add_image(&self, location: &str, size_bytes: u64) {
        if let Ok(mut state) = self.inner.lock() {
            state.store.files.insert(location.to_string(), size_bytes);
        }
    }

    pub fn file_exists(&self, location: &str) -> bool {
        self.inner
            .lock()
            .map(|s| s.store.files.contains_key(location))
            .unwrap_or(false)
    }

    /// Queues a one-shot fault for the next call reaching `point`.
    pub fn inject_fault(&self, point: FaultPoint, fault: Fault) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.push(point, fault);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.faults.clear();
        }
    }

    /// Sessions created and not yet unlocked or closed.
    pub fn open_sessions(&self) -> usize {
        self.inner.lock().map(|s| s.store.sessions.len()).unwrap_or(0)
    }

    /// Operations that have not reached a terminal state.
    pub fn pending_operations(&self) -> usize {
        self.inner.lock().map(|s| s.store.pending.len()).unwrap_or(0)
    }

    /// Looks a machine up by name whether or not it is registered.
    pub fn machine_by_name(&self, name: &str) -> Option<MachineInfo> {
        let state = self.inner.lock().ok()?;
        state
            .store
            .machines
            .values()
            .find(|m| m.name == name)
            .map(SimMachine::info)
    }

    pub fn boot_order(&self, machine: &MachineId) -> Vec<Option<DeviceType>> {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.store.machines.get(machine).map(|m| m.boot_order.to_vec()))
            .unwrap_or_default()
    }

    pub fn controllers(&self, machine: &MachineId) -> Vec<(String, StorageBus)> {
        self.inner
            .lock()
            .ok()
            .and_then(|s| {
                s.store
                    .machines
                    .get(machine)
                    .map(|m| m.controllers.iter().map(|c| (c.name.clone(), c.bus)).collect())
            })
            .unwrap_or_default()
    }

    pub fn attachment_count(&self, machine: &MachineId) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.store.machines.get(machine).map(|m| m.attachments.len()))
            .unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, SimState>> {
        self.inner.lock().map_err(|_| ProviderError::OperationFailed {
            code: result_code::E_FAIL,
            message: "simulated backend state poisoned".to_string(),
            details: Vec::new(),
        })
    }

    fn connected_state(&self) -> Result<MutexGuard<'_, SimState>> {
        let state = self.state()?;
        state.store.ensure_connected()?;
        Ok(state)
    }
}

impl SimState {
    /// Fails a synchronous call if a fault is queued for it.
    fn check_fault(&mut self, point: FaultPoint) -> Result<()> {
        match self.faults.take(point) {
            Some(Fault::Fail(details)) => Err(ProviderError::from_chain(details)),
            Some(Fault::Hang) | None => Ok(()),
        }
    }

    /// Queues an asynchronous operation, honouring any fault for `point`.
    fn start_operation(
        &mut self,
        point: FaultPoint,
        description: String,
        cancelable: bool,
        on_success: Effect,
        on_abort: Effect,
    ) -> Arc<dyn BackendProgress> {
        let (latency, failure) = match self.faults.take(point) {
            Some(Fault::Fail(details)) => (
                Some(self.latency),
                Some(ErrorInfo::from_details(&details).unwrap_or_else(|| {
                    ErrorInfo::new("operation failed", result_code::E_FAIL, "ProgressWrap", "")
                })),
            ),
            Some(Fault::Hang) => (None, None),
            None => (Some(self.latency), None),
        };

        debug!(operation = %description, ?latency, "Queued simulated operation");
        let progress = Arc::new(SimulatedProgress::new(description, latency, cancelable));
        self.store.pending.push(PendingOp {
            progress: Arc::clone(&progress),
            failure,
            on_success,
            on_abort,
        });
        progress
    }
}

fn medium_format(location: &str) -> &'static str {
    let lower = location.to_ascii_lowercase();
    if lower.ends_with(".vdi") {
        "VDI"
    } else if lower.ends_with(".vmdk") {
        "VMDK"
    } else if lower.ends_with(".vhd") {
        "VHD"
    } else {
        "RAW"
    }
}

fn guest_os_catalog() -> Vec<GuestOsType> {
    [
        ("Other", "Other/Unknown", "Other", 64, false),
        ("Linux26_64", "Linux 2.6 / 3.x / 4.x (64-bit)", "Linux", 1024, true),
        ("Fedora_64", "Fedora (64-bit)", "Linux", 2048, true),
        ("Ubuntu_64", "Ubuntu (64-bit)", "Linux", 2048, true),
        ("Debian_64", "Debian (64-bit)", "Linux", 1024, true),
        ("Windows10_64", "Windows 10 (64-bit)", "Windows", 2048, true),
    ]
    .into_iter()
    .map(|(id, description, family, memory, is_64_bit)| GuestOsType {
        id: id.to_string(),
        description: description.to_string(),
        family: family.to_string(),
        recommended_memory_mb: memory,
        is_64_bit,
    })
    .collect()
}

fn validate_memory(memory_mb: u64) -> Result<()> {
    if (MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&memory_mb) {
        Ok(())
    } else {
        Err(ProviderError::InvalidArgument(format!(
            "Invalid RAM size: {memory_mb} MB (must be in range [{MIN_MEMORY_MB}, {MAX_MEMORY_MB}] MB)"
        )))
    }
}

fn lock_conflict(machine: &SimMachine) -> ProviderError {
    ProviderError::InvalidObjectState(format!(
        "The machine '{}' is already locked for a session (or being unlocked)",
        machine.name
    ))
}

impl VirtualizationBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn connect(&self, endpoint: &BackendEndpoint, credentials: &Credentials) -> Result<()> {
        let mut state = self.state()?;
        if !state.reachable {
            return Err(ProviderError::Connection(format!(
                "connection refused: {endpoint}"
            )));
        }
        if let Some(required) = &state.required_credentials {
            if required != credentials {
                return Err(ProviderError::Connection(format!(
                    "authentication failed for user '{}'",
                    credentials.user.as_deref().unwrap_or("")
                )));
            }
        }
        state.store.connected = true;
        info!(endpoint = %endpoint, "Connected to simulated backend");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let mut state = self.state()?;
        state.store.connected = false;
        Ok(())
    }

    fn version(&self) -> Result<String> {
        self.connected_state()?;
        Ok(VERSION.to_string())
    }

    fn guest_os_types(&self) -> Result<Vec<GuestOsType>> {
        self.connected_state()?;
        Ok(guest_os_catalog())
    }

    fn list_machines(&self) -> Result<Vec<MachineInfo>> {
        let state = self.connected_state()?;
        let mut machines: Vec<MachineInfo> = state
            .store
            .machines
            .values()
            .filter(|m| m.registered)
            .map(SimMachine::info)
            .collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(machines)
    }

    fn find_machine(&self, name: &str) -> Result<MachineInfo> {
        let state = self.connected_state()?;
        state
            .store
            .registered_by_name(name)
            .map(SimMachine::info)
            .ok_or_else(|| {
                ProviderError::ObjectNotFound(format!(
                    "Could not find a registered machine named '{name}'"
                ))
            })
    }

    fn create_machine(
        &self,
        name: &str,
        os_type: &str,
        flags: &CreateFlags,
    ) -> Result<MachineInfo> {
        let mut state = self.connected_state()?;
        state.check_fault(FaultPoint::CreateMachine)?;

        if name.trim().is_empty() {
            return Err(ProviderError::InvalidArgument(
                "Machine name must not be empty".to_string(),
            ));
        }
        if state.store.registered_by_name(name).is_some() {
            return Err(ProviderError::AlreadyExists(format!(
                "Machine '{name}' is already registered"
            )));
        }

        let machine = SimMachine::new(name, os_type);
        let info = machine.info();
        debug!(machine = %name, flags = %flags.to_flag_string(), "Created machine object");
        state.store.machines.insert(machine.id, machine);
        Ok(info)
    }

    fn set_base_settings(&self, machine: &MachineId, settings: &BaseSettings) -> Result<()> {
        let mut state = self.connected_state()?;
        validate_memory(settings.memory_mb)?;
        let m = state.store.machine_mut(machine)?;
        if m.registered {
            return Err(ProviderError::InvalidObjectState(format!(
                "Machine '{}' is registered; change its settings through a locked session",
                m.name
            )));
        }
        m.memory_mb = settings.memory_mb;
        m.os_type = settings.os_type.clone();
        m.vram_mb = settings.vram_mb;
        m.graphics = settings.graphics;
        Ok(())
    }

    fn register_machine(&self, machine: &MachineId) -> Result<()> {
        let mut state = self.connected_state()?;
        state.check_fault(FaultPoint::RegisterMachine)?;

        let name = {
            let m = state.store.machine(machine)?;
            if m.registered {
                return Err(ProviderError::InvalidObjectState(format!(
                    "Machine '{}' is already registered",
                    m.name
                )));
            }
            m.name.clone()
        };
        if state.store.registered_by_name(&name).is_some() {
            return Err(ProviderError::AlreadyExists(format!(
                "Machine '{name}' is already registered"
            )));
        }
        state.store.machine_mut(machine)?.registered = true;
        info!(machine = %name, "Registered machine");
        Ok(())
    }

    fn create_session(&self) -> Result<SessionId> {
        let mut state = self.connected_state()?;
        let session = SessionId::new();
        state.store.sessions.insert(session, SessionBinding::Idle);
        Ok(session)
    }

    fn lock_machine(
        &self,
        session: &SessionId,
        machine: &MachineId,
        mode: LockMode,
    ) -> Result<()> {
        let mut state = self.connected_state()?;
        state.check_fault(FaultPoint::LockMachine)?;

        if state.store.binding(session)? != SessionBinding::Idle {
            return Err(ProviderError::InvalidObjectState(format!(
                "Session {session} is already in use"
            )));
        }

        let m = state.store.machine_mut(machine)?;
        if !m.registered {
            return Err(ProviderError::InvalidObjectState(format!(
                "Machine '{}' is not registered",
                m.name
            )));
        }
        match mode {
            LockMode::Write => {
                if m.is_locked() || m.power_state.has_process() {
                    return Err(lock_conflict(m));
                }
                m.write_holder = Some(*session);
            }
            LockMode::Shared => {
                if m.write_holder.is_some() {
                    return Err(lock_conflict(m));
                }
                m.shared_holders.insert(*session);
            }
        }
        debug!(machine = %m.name, %session, %mode, "Machine locked");
        state
            .store
            .sessions
            .insert(*session, SessionBinding::Locked(*machine, mode));
        Ok(())
    }

    fn unlock_machine(&self, session: &SessionId) -> Result<()> {
        let mut state = self.connected_state()?;
        match state.store.binding(session)? {
            SessionBinding::Idle => {
                return Err(ProviderError::InvalidObjectState(
                    "The session is not locked (session state: Unlocked)".to_string(),
                ))
            }
            SessionBinding::Locked(machine, _) => state.store.release_holder(&machine, session),
            SessionBinding::Launch(_) => {}
        }
        state.store.sessions.remove(session);
        Ok(())
    }

    fn close_session(&self, session: &SessionId) -> Result<()> {
        let mut state = self.connected_state()?;
        match state.store.sessions.remove(session) {
            Some(SessionBinding::Locked(machine, _)) => {
                state.store.release_holder(&machine, session);
                debug!(%session, "Closed a session that still held a lock");
            }
            Some(_) | None => {}
        }
        Ok(())
    }

    fn create_medium(
        &self,
        format: &str,
        location: &str,
        access: AccessMode,
        device_type: DeviceType,
    ) -> Result<MediumInfo> {
        let mut state = self.connected_state()?;
        if state.store.medium_by_location(location).is_some()
            || state.store.files.contains_key(location)
        {
            return Err(ProviderError::AlreadyExists(format!(
                "Cannot create the medium storage unit '{location}': file already exists"
            )));
        }
        let info = new_medium(location, &format.to_ascii_uppercase(), device_type, access, 0);
        state.store.media.insert(
            info.id,
            SimMedium {
                info: info.clone(),
                storage_created: false,
                attached_to: None,
            },
        );
        Ok(info)
    }

    fn create_base_storage(
        &self,
        medium: &MediumId,
        size_bytes: u64,
        variant: MediumVariant,
    ) -> Result<Arc<dyn BackendProgress>> {
        let mut state = self.connected_state()?;
        let location = {
            let m = state.store.medium(medium)?;
            if m.storage_created {
                return Err(ProviderError::InvalidObjectState(format!(
                    "Storage for medium '{}' already exists",
                    m.info.location
                )));
            }
            m.info.location.clone()
        };
        if size_bytes == 0 {
            return Err(ProviderError::InvalidArgument(
                "Medium size must be greater than zero".to_string(),
            ));
        }

        let id = *medium;
        let file = location.clone();
        let on_success: Effect = Box::new(move |store: &mut Store| {
            if let Some(m) = store.media.get_mut(&id) {
                m.storage_created = true;
                m.info.logical_size = size_bytes;
            }
            store.files.insert(file, size_bytes);
        });
        Ok(state.start_operation(
            FaultPoint::CreateBaseStorage,
            format!("Creating {variant:?} hard disk storage unit '{location}'"),
            true,
            on_success,
            Box::new(|_: &mut Store| {}),
        ))
    }

    fn open_medium(
        &self,
        location: &str,
        device_type: DeviceType,
        access: AccessMode,
        _force_new_uuid: bool,
    ) -> Result<MediumInfo> {
        let mut state = self.connected_state()?;
        state.check_fault(FaultPoint::OpenMedium)?;

        if let Some(existing) = state.store.medium_by_location(location) {
            if existing.info.device_type != device_type {
                return Err(ProviderError::InvalidArgument(format!(
                    "Medium '{location}' is already open as {}",
                    existing.info.device_type
                )));
            }
            return Ok(existing.info.clone());
        }

        let Some(size) = state.store.files.get(location).copied() else {
            return Err(ProviderError::from_chain(vec![ErrorDetail::new(
                format!("Could not find file for the medium '{location}' (VERR_FILE_NOT_FOUND)"),
                result_code::VBOX_E_FILE_ERROR,
                "MediumWrap",
                "{ad47ad09-787b-44ab-b343-a082a3f2dfb1}",
            )]));
        };

        let info = new_medium(location, medium_format(location), device_type, access, size);
        state.store.media.insert(
            info.id,
            SimMedium {
                info: info.clone(),
                storage_created: true,
                attached_to: None,
            },
        );
        Ok(info)
    }

    fn add_storage_controller(
        &self,
        session: &SessionId,
        name: &str,
        bus: StorageBus,
    ) -> Result<()> {
        let mut state = self.connected_state()?;
        let m = state.store.write_session_machine(session)?;
        if m.controllers.iter().any(|c| c.name == name) {
            return Err(ProviderError::AlreadyExists(format!(
                "Storage controller named '{name}' already exists"
            )));
        }
        m.controllers.push(SimController {
            name: name.to_string(),
            bus,
        });
        Ok(())
    }

    fn attach_device(
        &self,
        session: &SessionId,
        controller: &str,
        port: u32,
        device: u32,
        device_type: DeviceType,
        medium: Option<&MediumId>,
    ) -> Result<()> {
        let mut state = self.connected_state()?;
        state.check_fault(FaultPoint::AttachDevice)?;

        let machine_id = state.store.write_session_machine(session)?.id;
        {
            let m = state.store.machine(&machine_id)?;
            let bus = m
                .controllers
                .iter()
                .find(|c| c.name == controller)
                .map(|c| c.bus)
                .ok_or_else(|| {
                    ProviderError::ObjectNotFound(format!(
                        "Could not find a storage controller named '{controller}'"
                    ))
                })?;
            if port >= bus.port_count() || device >= bus.devices_per_port() {
                return Err(ProviderError::InvalidArgument(format!(
                    "Invalid port {port} / device {device} for controller '{controller}'"
                )));
            }
            if !bus.accepts(device_type) {
                return Err(ProviderError::InvalidArgument(format!(
                    "Controller '{controller}' cannot hold a {device_type} device"
                )));
            }
            if m.attachments
                .iter()
                .any(|a| a.controller == controller && a.port == port && a.device == device)
            {
                return Err(ProviderError::InvalidObjectState(format!(
                    "Medium already attached to port {port}, device {device} of controller '{controller}'"
                )));
            }
        }

        if let Some(medium_id) = medium {
            let med = state.store.medium(medium_id)?;
            if med.info.device_type != device_type {
                return Err(ProviderError::InvalidArgument(format!(
                    "Medium '{}' is a {} image, not {device_type}",
                    med.info.location, med.info.device_type
                )));
            }
            if !med.storage_created {
                return Err(ProviderError::InvalidObjectState(format!(
                    "Medium '{}' has no storage yet",
                    med.info.location
                )));
            }
            if med.attached_to.is_some() {
                return Err(ProviderError::InvalidObjectState(format!(
                    "Medium '{}' is already attached",
                    med.info.location
                )));
            }
        }

        if let Some(medium_id) = medium {
            if let Some(med) = state.store.media.get_mut(medium_id) {
                med.attached_to = Some(machine_id);
            }
        }
        state
            .store
            .machine_mut(&machine_id)?
            .attachments
            .push(SimAttachment {
                controller: controller.to_string(),
                port,
                device,
                device_type,
                medium: medium.copied(),
            });
        Ok(())
    }

    fn set_boot_order(
        &self,
        session: &SessionId,
        position: u32,
        device_type: Option<DeviceType>,
    ) -> Result<()> {
        let mut state = self.connected_state()?;
        if position == 0 || position as usize > BOOT_SLOTS {
            return Err(ProviderError::InvalidArgument(format!(
                "Invalid boot position: {position} (must be in range [1, {BOOT_SLOTS}])"
            )));
        }
        let m = state.store.write_session_machine(session)?;
        m.boot_order[position as usize - 1] = device_type;
        Ok(())
    }

    fn set_memory_size(&self, session: &SessionId, memory_mb: u64) -> Result<()> {
        let mut state = self.connected_state()?;
        validate_memory(memory_mb)?;
        state.store.write_session_machine(session)?.memory_mb = memory_mb;
        Ok(())
    }

    fn save_settings(&self, session: &SessionId) -> Result<()> {
        let mut state = self.connected_state()?;
        state.check_fault(FaultPoint::SaveSettings)?;
        state.store.write_session_machine(session)?.saved = true;
        Ok(())
    }

    fn unregister_machine(
        &self,
        machine: &MachineId,
        mode: CleanupMode,
    ) -> Result<Vec<MediumInfo>> {
        let mut state = self.connected_state()?;
        state.check_fault(FaultPoint::UnregisterMachine)?;

        let attachments = {
            let m = state.store.machine_mut(machine)?;
            if !m.registered {
                return Err(ProviderError::InvalidObjectState(format!(
                    "Machine '{}' is not registered",
                    m.name
                )));
            }
            if m.is_locked() || m.power_state.has_process() {
                return Err(ProviderError::InvalidVmState(format!(
                    "Cannot unregister the machine '{}' while it is locked",
                    m.name
                )));
            }
            m.registered = false;
            std::mem::take(&mut m.attachments)
        };

        let mut returned: Vec<MediumInfo> = Vec::new();
        for attachment in attachments {
            let Some(medium_id) = attachment.medium else {
                continue;
            };
            if let Some(med) = state.store.media.get_mut(&medium_id) {
                med.attached_to = None;
                if mode.returns(med.info.device_type)
                    && !returned.iter().any(|r| r.id == medium_id)
                {
                    returned.push(med.info.clone());
                }
            }
        }
        info!(%machine, returned = returned.len(), "Unregistered machine");
        Ok(returned)
    }

    fn delete_config(&self, machine: &MachineId, media: &[MediumId]) -> Result<()> {
        let mut state = self.connected_state()?;
        state.check_fault(FaultPoint::DeleteConfig)?;

        let m = state.store.machine(machine)?;
        if m.registered {
            return Err(ProviderError::InvalidVmState(format!(
                "Cannot delete settings of the registered machine '{}'",
                m.name
            )));
        }
        for medium_id in media {
            let med = state.store.medium(medium_id)?;
            if med.attached_to.is_some() {
                return Err(ProviderError::InvalidObjectState(format!(
                    "Medium '{}' is still attached to a machine",
                    med.info.location
                )));
            }
        }

        for medium_id in media {
            if let Some(med) = state.store.media.remove(medium_id) {
                if med.info.device_type == DeviceType::HardDisk
                    && med.info.access_mode == AccessMode::ReadWrite
                {
                    state.store.files.remove(&med.info.location);
                }
            }
        }
        state.store.machines.remove(machine);
        Ok(())
    }

    fn power_down(&self, session: &SessionId) -> Result<Arc<dyn BackendProgress>> {
        let mut state = self.connected_state()?;
        let machine_id = match state.store.binding(session)? {
            SessionBinding::Locked(machine, _) | SessionBinding::Launch(machine) => machine,
            SessionBinding::Idle => {
                return Err(ProviderError::InvalidObjectState(
                    "The session is not locked (session state: Unlocked)".to_string(),
                ))
            }
        };
        let name = {
            let m = state.store.machine(&machine_id)?;
            if m.power_state != PowerState::Running {
                return Err(ProviderError::InvalidVmState(format!(
                    "{:?} (must be Running)",
                    m.power_state
                )));
            }
            m.name.clone()
        };
        state.check_fault(FaultPoint::PowerDown)?;
        state.store.machine_mut(&machine_id)?.power_state = PowerState::Stopping;

        let on_success: Effect = Box::new(move |store: &mut Store| {
            if let Some(m) = store.machines.get_mut(&machine_id) {
                m.power_state = PowerState::PoweredOff;
            }
        });
        let on_abort: Effect = Box::new(move |store: &mut Store| {
            if let Some(m) = store.machines.get_mut(&machine_id) {
                m.power_state = PowerState::Running;
            }
        });
        Ok(state.start_operation(
            FaultPoint::PowerDown,
            format!("Powering off the virtual machine '{name}'"),
            false,
            on_success,
            on_abort,
        ))
    }

    fn launch_process(
        &self,
        session: &SessionId,
        machine: &MachineId,
        mode: LaunchMode,
        env: &[String],
    ) -> Result<Arc<dyn BackendProgress>> {
        let mut state = self.connected_state()?;
        if state.store.binding(session)? != SessionBinding::Idle {
            return Err(ProviderError::InvalidObjectState(format!(
                "The given session {session} is busy"
            )));
        }
        let name = {
            let m = state.store.machine(machine)?;
            if !m.registered {
                return Err(ProviderError::InvalidObjectState(format!(
                    "Machine '{}' is not registered",
                    m.name
                )));
            }
            if m.power_state.has_process() {
                return Err(ProviderError::InvalidVmState(format!(
                    "Machine '{}' is already running",
                    m.name
                )));
            }
            if m.write_holder.is_some() {
                return Err(lock_conflict(m));
            }
            m.name.clone()
        };
        state.check_fault(FaultPoint::LaunchProcess)?;

        state.store.machine_mut(machine)?.power_state = PowerState::Starting;
        state
            .store
            .sessions
            .insert(*session, SessionBinding::Launch(*machine));
        debug!(machine = %name, mode = mode.as_str(), env_vars = env.len(), "Launching VM process");

        let machine_id = *machine;
        let session_id = *session;
        let on_success: Effect = Box::new(move |store: &mut Store| {
            if let Some(m) = store.machines.get_mut(&machine_id) {
                m.power_state = PowerState::Running;
            }
        });
        let on_abort: Effect = Box::new(move |store: &mut Store| {
            if let Some(m) = store.machines.get_mut(&machine_id) {
                m.power_state = PowerState::PoweredOff;
            }
            if let Some(binding) = store.sessions.get_mut(&session_id) {
                *binding = SessionBinding::Idle;
            }
        });
        Ok(state.start_operation(
            FaultPoint::LaunchProcess,
            format!("Starting virtual machine '{name}' ({})", mode.as_str()),
            true,
            on_success,
            on_abort,
        ))
    }

    fn service_events(&self, _timeout_ms: u64) -> Result<()> {
        let mut state = self.state()?;
        state.store.service();
        Ok(())
    }
}
