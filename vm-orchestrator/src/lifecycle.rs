use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use vm_config::{AttachmentSpec, MachineSpec, MediumSource, OrchestratorConfig};
use vm_core::{
    AccessMode, CleanupMode, DeviceType, LaunchMode, LockMode, MachineId, MediumId, SessionId,
};
use vm_provider::{
    get_backend, BackendEndpoint, Credentials, GuestOsType, VirtualizationBackend,
};

use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::machine::{BaseConfig, Machine, MachineState};
use crate::media::StorageMedium;
use crate::operation::{Operation, OperationLog, OperationType};
use crate::progress::{ProgressHandle, ProgressKind, ProgressTracker};
use crate::registry::MachineRegistry;
use crate::session::{SessionHandle, SessionLock};

/// Outcome of a destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyReport {
    pub name: String,
    /// `false` when no machine of that name existed.
    pub existed: bool,
    /// Media whose registration (and, for writable disks, storage) was removed.
    pub removed_media: Vec<StorageMedium>,
}

/// Composite lifecycle operations over one backend.
///
/// Clones share the registry, lock table, tracker and journal, so several
/// tasks can drive different machines through the same orchestrator.
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    backend: Arc<dyn VirtualizationBackend>,
    registry: MachineRegistry,
    locks: SessionLock,
    tracker: ProgressTracker,
    config: OrchestratorConfig,
    journal: OperationLog,
    pending_stops: Arc<Mutex<HashMap<String, ProgressHandle>>>,
}

fn default_access(device_type: DeviceType) -> AccessMode {
    match device_type {
        DeviceType::HardDisk => AccessMode::ReadWrite,
        DeviceType::Dvd | DeviceType::Floppy => AccessMode::ReadOnly,
    }
}

impl LifecycleOrchestrator {
    pub fn new(backend: Arc<dyn VirtualizationBackend>, config: OrchestratorConfig) -> Self {
        let registry = MachineRegistry::new(Arc::clone(&backend));
        let locks = SessionLock::new(Arc::clone(&backend), registry.clone());
        let tracker = ProgressTracker::new(
            Arc::clone(&backend),
            config.poll_interval(),
            config.event_wait_ms,
        );
        Self {
            backend,
            registry,
            locks,
            tracker,
            config,
            journal: OperationLog::new(),
            pending_stops: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builds an orchestrator for the backend `config.endpoint` selects.
    ///
    /// The backend is not connected yet; call [`LifecycleOrchestrator::connect`].
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = BackendEndpoint::parse(&config.endpoint)?;
        let backend = get_backend(&endpoint)?;
        Ok(Self::new(backend, config))
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &SessionLock {
        &self.locks
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Journal of composite operations, oldest first.
    pub fn operations(&self) -> Vec<Operation> {
        self.journal.list()
    }

    /// Connects with the endpoint and credentials from the configuration.
    pub fn connect(&self) -> Result<()> {
        let endpoint = BackendEndpoint::parse(&self.config.endpoint)?;
        let credentials = match &self.config.user {
            Some(user) => Credentials {
                user: Some(user.clone()),
                password: self.config.password.clone(),
            },
            None => Credentials::anonymous(),
        };
        self.connect_to(&endpoint, &credentials)
    }

    pub fn connect_to(&self, endpoint: &BackendEndpoint, credentials: &Credentials) -> Result<()> {
        self.backend.connect(endpoint, credentials)?;
        info!(endpoint = %endpoint, backend = self.backend.name(), "Connected");
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.backend.disconnect()?;
        debug!("Disconnected");
        Ok(())
    }

    pub fn backend_version(&self) -> Result<String> {
        Ok(self.backend.version()?)
    }

    pub fn guest_os_types(&self) -> Result<Vec<GuestOsType>> {
        Ok(self.backend.guest_os_types()?)
    }

    /// Registered machines, reconciled with the backend.
    pub fn list_machines(&self) -> Result<Vec<Machine>> {
        self.registry.refresh()
    }

    /// Moves a machine to a settled state after a failure, logging if that fails too.
    fn settle(&self, id: &MachineId, state: MachineState) {
        if let Err(e) = self.registry.set_state(id, state) {
            warn!(%id, %state, error = %e, "Could not settle machine state");
        }
    }

    /// Creates, configures and registers a machine from `spec`.
    ///
    /// An existing machine with the same name is destroyed first, unless
    /// another provision of that name is in flight, in which case this call
    /// fails with `DuplicateName`. Failures after registration roll the
    /// machine back; a failing rollback is attached to the returned error.
    #[instrument(skip_all, fields(machine = %spec.name))]
    pub async fn provision(&self, spec: &MachineSpec) -> Result<Machine> {
        let op = self.journal.begin(&spec.name, OperationType::Provision);
        let result = self.provision_machine(spec).await;
        self.journal.finish(&op, &result);
        result
    }

    async fn provision_machine(&self, spec: &MachineSpec) -> Result<Machine> {
        spec.validate()?;
        self.ensure_absent(&spec.name).await?;

        let base = BaseConfig {
            memory_mb: spec.memory_mb,
            vram_mb: spec.vram_mb,
            graphics: spec.graphics,
        };
        let machine = self.registry.create(&spec.name, &spec.os_type, &base)?;
        let machine = match self.registry.register(&machine.id) {
            Ok(machine) => machine,
            Err(e) => {
                return Err(match self.registry.discard(&machine.id) {
                    Ok(()) => e,
                    Err(cleanup) => e.with_cleanup_failure(cleanup),
                });
            }
        };

        let mut created = Vec::new();
        match self.configure(&machine, spec, &mut created).await {
            Ok(()) => {
                self.registry.end_operation(&spec.name);
                let machine = self.registry.get(&machine.id)?;
                info!(
                    id = %machine.id,
                    memory_mb = machine.memory_mb,
                    os_type = %machine.os_type,
                    "Machine provisioned"
                );
                Ok(machine)
            }
            Err(e) => {
                warn!(error = %e, "Provisioning failed, rolling back");
                let rollback = self.rollback(&machine, &created);
                self.registry.end_operation(&spec.name);
                match rollback {
                    Ok(()) => Err(e),
                    Err(cleanup) => {
                        warn!(error = %cleanup, "Rollback failed");
                        Err(e.with_cleanup_failure(cleanup))
                    }
                }
            }
        }
    }

    /// Removes any machine called `name` so a provision can reuse the name.
    async fn ensure_absent(&self, name: &str) -> Result<()> {
        if let Some(active) = self.registry.active_operation(name) {
            debug!(machine = %name, active = active.as_str(), "Name is busy, not removing");
            return Ok(());
        }
        match self.destroy_machine(name).await {
            Ok(report) => {
                if report.existed {
                    info!(machine = %name, "Removed existing machine");
                }
                Ok(())
            }
            Err(e) if e.is_kind(ErrorKind::LockConflict) => Err(OrchestratorError::DuplicateName(
                format!("'{}' exists and is in use: {}", name, e),
            )),
            Err(e) => Err(e),
        }
    }

    /// Applies `spec` under a write lock, releasing the lock whatever happens.
    async fn configure(
        &self,
        machine: &Machine,
        spec: &MachineSpec,
        created: &mut Vec<StorageMedium>,
    ) -> Result<()> {
        let handle = self
            .locks
            .acquire_with_retry(&machine.id, LockMode::Write, &self.config.lock_retry)
            .await?;
        let applied = self.apply_spec(&handle, spec, created).await;
        let released = self.locks.release(&handle);
        applied?;
        released
    }

    async fn apply_spec(
        &self,
        handle: &SessionHandle,
        spec: &MachineSpec,
        created: &mut Vec<StorageMedium>,
    ) -> Result<()> {
        for controller in &spec.controllers {
            self.registry
                .add_storage_controller(handle, &controller.name, controller.bus)?;
        }

        for attachment in &spec.attachments {
            let medium = self.prepare_medium(attachment, created).await?;
            self.registry.attach_device(
                handle,
                &attachment.controller,
                attachment.port,
                attachment.device,
                attachment.device_type,
                medium.as_ref(),
            )?;
            debug!(
                controller = %attachment.controller,
                port = attachment.port,
                device = attachment.device,
                device_type = %attachment.device_type,
                "Device attached"
            );
        }

        for (slot, device_type) in spec.boot_order.iter().enumerate() {
            self.registry
                .set_boot_order(handle, slot as u32 + 1, Some(*device_type))?;
        }

        self.registry.save_settings(handle)
    }

    /// Opens or creates the medium for an attachment. Empty drives yield `None`.
    async fn prepare_medium(
        &self,
        attachment: &AttachmentSpec,
        created: &mut Vec<StorageMedium>,
    ) -> Result<Option<MediumId>> {
        match &attachment.medium {
            None => Ok(None),
            Some(MediumSource::Open { location, access }) => {
                let access = access.unwrap_or_else(|| default_access(attachment.device_type));
                let medium = self
                    .registry
                    .open_medium(location, attachment.device_type, access)?;
                Ok(Some(medium.id))
            }
            Some(MediumSource::Create {
                location,
                format,
                size_bytes,
                variant,
            }) => {
                let medium = self
                    .registry
                    .create_medium(format, location, attachment.device_type)?;
                created.push(medium.clone());

                let progress = self
                    .registry
                    .create_base_storage(&medium.id, *size_bytes, *variant)?;
                let tracked = self.tracker.track(progress, ProgressKind::CreateStorage);
                if let Err(e) = self
                    .tracker
                    .await_completion(&tracked, self.config.timeouts.create_storage())
                    .await
                {
                    if e.is_kind(ErrorKind::Timeout) {
                        self.tracker.cancel(&tracked);
                        self.tracker.forget(&tracked);
                    }
                    return Err(e);
                }
                self.registry.mark_storage_created(&medium.id, *size_bytes)?;
                info!(location = %location, size_bytes, ?variant, "Disk created");
                Ok(Some(medium.id))
            }
        }
    }

    /// Unregisters a half-provisioned machine and deletes what was created for it.
    fn rollback(&self, machine: &Machine, created: &[StorageMedium]) -> Result<()> {
        let mut media = self.registry.unregister(&machine.id, CleanupMode::Full)?;
        for medium in created {
            if !media.iter().any(|m| m.id == medium.id) {
                media.push(medium.clone());
            }
        }
        self.registry.delete_config(&machine.id, &media)
    }

    /// Launches the VM process of a registered, powered-off machine.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str, mode: LaunchMode) -> Result<Machine> {
        let op = self.journal.begin(name, OperationType::Start);
        let result = self.start_machine(name, mode).await;
        self.journal.finish(&op, &result);
        result
    }

    async fn start_machine(&self, name: &str, mode: LaunchMode) -> Result<Machine> {
        let machine = self.registry.find(name)?;
        if !machine.state.can_start() {
            return Err(OrchestratorError::InvalidState(format!(
                "'{}' is {}; only a registered, powered-off machine can be started",
                name, machine.state
            )));
        }
        self.registry.begin_operation(name, OperationType::Start)?;
        let result = self.launch(&machine, mode).await;
        self.registry.end_operation(name);
        result
    }

    async fn launch(&self, machine: &Machine, mode: LaunchMode) -> Result<Machine> {
        self.registry.set_state(&machine.id, MachineState::Starting)?;

        // Launching binds its own session; the configuration lock is not taken.
        let session = match self.backend.create_session() {
            Ok(session) => session,
            Err(e) => {
                self.settle(&machine.id, MachineState::Registered);
                return Err(e.into());
            }
        };
        let progress = match self.backend.launch_process(
            &session,
            &machine.id,
            mode,
            &self.config.launch_env,
        ) {
            Ok(progress) => progress,
            Err(e) => {
                self.close_quietly(&session);
                self.settle(&machine.id, MachineState::Registered);
                return Err(e.into());
            }
        };

        let tracked = self.tracker.track(progress, ProgressKind::Launch);
        match self
            .tracker
            .await_completion(&tracked, self.config.timeouts.start())
            .await
        {
            Ok(()) => {
                if let Err(e) = self.backend.unlock_machine(&session) {
                    debug!(error = %e, "Launch session already closed");
                }
                self.registry.set_state(&machine.id, MachineState::Running)?;
                info!(mode = mode.as_str(), "Machine running");
                self.registry.get(&machine.id)
            }
            Err(e) => {
                if e.is_kind(ErrorKind::Timeout) {
                    let canceled = self.tracker.cancel(&tracked);
                    self.tracker.forget(&tracked);
                    warn!(canceled, "Launch timed out");
                }
                self.close_quietly(&session);
                self.settle(&machine.id, MachineState::Registered);
                Err(e)
            }
        }
    }

    /// Powers a running machine down, waiting at most `timeout`.
    ///
    /// On timeout the machine is reported as still running and the power-down
    /// stays available through [`LifecycleOrchestrator::pending_operation`].
    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<Machine> {
        let op = self.journal.begin(name, OperationType::Stop);
        let result = self.stop_machine(name, timeout).await;
        self.journal.finish(&op, &result);
        result
    }

    /// Stops with the configured stop timeout.
    pub async fn stop_default(&self, name: &str) -> Result<Machine> {
        self.stop(name, self.config.timeouts.stop()).await
    }

    async fn stop_machine(&self, name: &str, timeout: Duration) -> Result<Machine> {
        let machine = self.registry.find(name)?;
        if !machine.state.can_stop() {
            return Err(OrchestratorError::InvalidState(format!(
                "'{}' is {}; only a running machine can be stopped",
                name, machine.state
            )));
        }
        self.registry.begin_operation(name, OperationType::Stop)?;
        let result = self.power_down(&machine, timeout).await;
        self.registry.end_operation(name);
        result
    }

    async fn power_down(&self, machine: &Machine, timeout: Duration) -> Result<Machine> {
        let handle = self
            .locks
            .acquire_with_retry(&machine.id, LockMode::Shared, &self.config.lock_retry)
            .await?;
        if let Err(e) = self.registry.set_state(&machine.id, MachineState::Stopping) {
            self.release_quietly(&handle);
            return Err(e);
        }

        let progress = match self.backend.power_down(handle.session_id()) {
            Ok(progress) => progress,
            Err(e) => {
                self.release_quietly(&handle);
                self.settle(&machine.id, MachineState::Running);
                return Err(e.into());
            }
        };
        let tracked = self.tracker.track(progress, ProgressKind::PowerDown);
        let result = self.tracker.await_completion(&tracked, timeout).await;
        self.release_quietly(&handle);

        match result {
            Ok(()) => {
                self.settle(&machine.id, MachineState::Registered);
                info!("Machine stopped");
                self.registry.get(&machine.id)
            }
            Err(e) => {
                self.settle(&machine.id, MachineState::Running);
                if e.is_kind(ErrorKind::Timeout) {
                    warn!("Power-down still in progress");
                    if let Ok(mut pending) = self.pending_stops.lock() {
                        pending.insert(machine.name.clone(), tracked);
                    }
                }
                Err(e)
            }
        }
    }

    fn close_quietly(&self, session: &SessionId) {
        if let Err(e) = self.backend.close_session(session) {
            debug!(%session, error = %e, "Could not close launch session");
        }
    }

    fn release_quietly(&self, handle: &SessionHandle) {
        if let Err(e) = self.locks.release(handle) {
            warn!(machine = %handle.machine_name(), error = %e, "Could not release lock");
        }
    }

    /// Power-down left running by a timed-out stop of `name`.
    pub fn pending_operation(&self, name: &str) -> Option<ProgressHandle> {
        self.pending_stops
            .lock()
            .ok()
            .and_then(|pending| pending.get(name).cloned())
    }

    /// Waits again for a power-down that outlived its stop call.
    pub async fn await_pending(&self, name: &str, timeout: Duration) -> Result<Machine> {
        let handle = self.pending_operation(name).ok_or_else(|| {
            OrchestratorError::NotFound(format!("no pending operation for '{}'", name))
        })?;
        match self.tracker.await_completion(&handle, timeout).await {
            Err(e) if e.is_kind(ErrorKind::Timeout) => return Err(e),
            result => {
                if let Ok(mut pending) = self.pending_stops.lock() {
                    pending.remove(name);
                }
                result?;
            }
        }
        let machine = self.registry.find(name)?;
        self.settle(&machine.id, MachineState::Registered);
        info!(machine = %name, "Pending power-down finished");
        self.registry.get(&machine.id)
    }

    /// Unregisters a machine and deletes its settings and returned media.
    ///
    /// Destroying a name that does not exist succeeds, after retrying any
    /// cleanup an earlier destroy or rollback left unfinished.
    #[instrument(skip(self))]
    pub async fn destroy(&self, name: &str) -> Result<DestroyReport> {
        let op = self.journal.begin(name, OperationType::Destroy);
        let result = self.destroy_machine(name).await;
        self.journal.finish(&op, &result);
        result
    }

    async fn destroy_machine(&self, name: &str) -> Result<DestroyReport> {
        let machine = match self.registry.find(name) {
            Ok(machine) => machine,
            Err(e) if e.is_kind(ErrorKind::NotFound) => {
                let removed_media = self.registry.retry_cleanup(name)?;
                return Ok(DestroyReport {
                    name: name.to_string(),
                    existed: false,
                    removed_media,
                });
            }
            Err(e) => return Err(e),
        };

        self.registry.begin_operation(name, OperationType::Destroy)?;
        let result = self.remove(&machine).await;
        self.registry.end_operation(name);
        result
    }

    async fn remove(&self, machine: &Machine) -> Result<DestroyReport> {
        // Taking the write lock proves no session or VM process holds the machine.
        let handle = match self
            .locks
            .acquire_with_retry(&machine.id, LockMode::Write, &self.config.lock_retry)
            .await
        {
            Ok(handle) => handle,
            Err(e) if e.is_kind(ErrorKind::NotFound) => return self.removed_elsewhere(machine),
            Err(e) => return Err(e),
        };
        self.locks.release(&handle)?;
        self.registry
            .set_state(&machine.id, MachineState::Destroying)?;

        let media = match self.registry.unregister(&machine.id, self.config.cleanup_mode) {
            Ok(media) => media,
            Err(e) if e.is_kind(ErrorKind::NotFound) => return self.removed_elsewhere(machine),
            Err(e) => {
                self.settle(&machine.id, MachineState::Registered);
                return Err(e);
            }
        };
        self.registry.delete_config(&machine.id, &media)?;

        for medium in &media {
            info!(
                medium = %medium.name,
                format = %medium.format,
                description = %medium.description,
                "Removed medium"
            );
        }
        info!(machine = %machine.name, media = media.len(), "Machine destroyed");
        Ok(DestroyReport {
            name: machine.name.clone(),
            existed: true,
            removed_media: media,
        })
    }

    /// Another client destroyed `machine` after it was looked up.
    fn removed_elsewhere(&self, machine: &Machine) -> Result<DestroyReport> {
        info!(machine = %machine.name, "Machine already removed by another client");
        self.registry.evict(&machine.name, &machine.id)?;
        Ok(DestroyReport {
            name: machine.name.clone(),
            existed: false,
            removed_media: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationStatus;
    use crate::test_utils::test_orchestrator;
    use vm_core::StorageBus;
    use vm_provider::simulated::{Fault, FaultPoint};

    fn spec(name: &str) -> MachineSpec {
        MachineSpec::new(name, "Ubuntu_64", 2048)
            .with_controller("SATA", StorageBus::Sata)
            .with_new_disk("SATA", 0, format!("/vms/{name}/{name}.vdi"), 8 << 30)
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_applies_spec() {
        let (backend, orch) = test_orchestrator();
        let spec = spec("vmA").with_boot_order(vec![DeviceType::HardDisk]);
        let vm = orch.provision(&spec).await.unwrap();

        assert_eq!(vm.state, MachineState::Registered);
        assert_eq!(vm.memory_mb, 2048);
        assert_eq!(vm.os_type, "Ubuntu_64");
        assert_eq!(vm.attached_media().len(), 1);
        assert_eq!(backend.attachment_count(&vm.id), 1);
        assert_eq!(backend.boot_order(&vm.id)[0], Some(DeviceType::HardDisk));
        assert!(backend.file_exists("/vms/vmA/vmA.vdi"));
        assert_eq!(orch.registry().active_operation("vmA"), None);

        let disk = orch.registry().medium(&vm.attached_media()[0]).unwrap();
        assert_eq!(disk.logical_size, 8 << 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_replaces_existing_machine() {
        let (backend, orch) = test_orchestrator();
        let first = orch.provision(&spec("vmA")).await.unwrap();
        let second = orch
            .provision(&MachineSpec::new("vmA", "Debian_64", 512))
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.memory_mb, 512);
        assert!(!backend.file_exists("/vms/vmA/vmA.vdi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_rejects_invalid_spec() {
        let (_backend, orch) = test_orchestrator();
        let err = orch
            .provision(&MachineSpec::new("", "Other", 1024))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_provision_rolls_back() {
        let (backend, orch) = test_orchestrator();
        backend.inject_fault(FaultPoint::SaveSettings, Fault::Fail(vec![]));

        let err = orch.provision(&spec("vmA")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);
        assert!(err.cleanup_failure().is_none());

        assert!(backend.machine_by_name("vmA").is_none());
        assert!(!backend.file_exists("/vms/vmA/vmA.vdi"));
        assert_eq!(
            orch.registry().find("vmA").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(orch.registry().pending_cleanup("vmA").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_returns_to_registered() {
        let (backend, orch) = test_orchestrator();
        orch.provision(&spec("vmA")).await.unwrap();
        backend.inject_fault(FaultPoint::LaunchProcess, Fault::Fail(vec![]));

        let err = orch.start("vmA", LaunchMode::Headless).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);
        assert_eq!(
            orch.registry().find("vmA").unwrap().state,
            MachineState::Registered
        );

        // The machine can still be started afterwards.
        let vm = orch.start("vmA", LaunchMode::Headless).await.unwrap();
        assert_eq!(vm.state, MachineState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_cancels_launch() {
        let (backend, orch) = test_orchestrator();
        orch.provision(&spec("vmA")).await.unwrap();
        backend.inject_fault(FaultPoint::LaunchProcess, Fault::Hang);

        let err = orch.start("vmA", LaunchMode::Gui).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            orch.registry().find("vmA").unwrap().state,
            MachineState::Registered
        );
        assert!(orch.tracker().pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_preconditions() {
        let (_backend, orch) = test_orchestrator();
        orch.provision(&spec("vmA")).await.unwrap();

        let err = orch.stop("vmA", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        orch.start("vmA", LaunchMode::Headless).await.unwrap();
        let err = orch.start("vmA", LaunchMode::Headless).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        // A running machine cannot be destroyed.
        let err = orch.destroy("vmA").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert_eq!(
            orch.registry().find("vmA").unwrap().state,
            MachineState::Running
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_over_running_machine_is_duplicate() {
        let (_backend, orch) = test_orchestrator();
        orch.provision(&spec("vmA")).await.unwrap();
        orch.start("vmA", LaunchMode::Headless).await.unwrap();

        let err = orch.provision(&spec("vmA")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_reports_removed_media() {
        let (backend, orch) = test_orchestrator();
        backend.add_image("/isos/fedora.iso", 1 << 20);
        let spec = spec("vmA")
            .with_controller("IDE", StorageBus::Ide)
            .with_dvd("IDE", 1, 0, "/isos/fedora.iso");
        orch.provision(&spec).await.unwrap();

        let report = orch.destroy("vmA").await.unwrap();
        assert!(report.existed);
        // Only hard disks are handed back by the default cleanup mode.
        assert_eq!(report.removed_media.len(), 1);
        assert_eq!(report.removed_media[0].name, "vmA.vdi");
        assert!(!backend.file_exists("/vms/vmA/vmA.vdi"));
        assert!(backend.file_exists("/isos/fedora.iso"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_records_outcomes() {
        let (_backend, orch) = test_orchestrator();
        orch.provision(&spec("vmA")).await.unwrap();
        let _ = orch.stop("vmA", Duration::from_secs(1)).await;
        orch.destroy("vmA").await.unwrap();

        let ops = orch.operations();
        let kinds: Vec<(OperationType, OperationStatus)> = ops
            .iter()
            .map(|op| (op.operation_type, op.status))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (OperationType::Provision, OperationStatus::Success),
                (OperationType::Stop, OperationStatus::Failed),
                (OperationType::Destroy, OperationStatus::Success),
            ]
        );
        assert!(ops[1].error.is_some());
    }

    #[test]
    fn test_from_config_rejects_webservice_without_transport() {
        let mut config = OrchestratorConfig::default();
        config.endpoint = "http://localhost:18083".to_string();
        let err = LifecycleOrchestrator::from_config(config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_connect_with_configured_credentials() {
        use vm_provider::simulated::SimulatedBackend;

        let backend = SimulatedBackend::new();
        backend.require_credentials(Credentials::new("admin", "secret"));
        let mut config = OrchestratorConfig::default();
        config.user = Some("admin".to_string());
        config.password = Some("wrong".to_string());
        let orch = LifecycleOrchestrator::new(Arc::new(backend.clone()), config.clone());
        assert_eq!(orch.connect().unwrap_err().kind(), ErrorKind::Connection);

        config.password = Some("secret".to_string());
        let orch = LifecycleOrchestrator::new(Arc::new(backend), config);
        orch.connect().unwrap();
        assert!(orch.backend_version().unwrap().contains("SIMULATED"));
        assert!(!orch.guest_os_types().unwrap().is_empty());
        assert!(orch.list_machines().unwrap().is_empty());
    }
}
