//! Virtualization backend abstraction.
//!
//! This library defines the capability the orchestrator consumes from a
//! hypervisor platform: machine lookup and creation, sessions and machine
//! locks, media, storage controllers and the long-running operations
//! (launch, power-down, base storage creation) that report through progress
//! objects. A simulated in-process backend is included for tests and dry runs.

// Standard library
use std::sync::Arc;

// Internal imports
use vm_core::{
    AccessMode, CleanupMode, DeviceType, LaunchMode, LockMode, MachineId, MediumId, MediumVariant,
    SessionId, StorageBus,
};

pub mod endpoint;
pub mod error;
pub mod progress;
pub mod types;

#[cfg(feature = "simulated")]
pub mod simulated;

pub use endpoint::{BackendEndpoint, BackendKind};
pub use error::{ProviderError, Result};
pub use progress::{BackendProgress, ErrorInfo};
pub use types::{
    BaseSettings, CreateFlags, Credentials, GuestOsType, MachineInfo, MediumInfo, PowerState,
};

/// The contract every hypervisor backend fulfils.
///
/// Calls are blocking and expected to return quickly; anything long-running
/// hands back a [`BackendProgress`]. Methods taking a `session` operate on the
/// mutable machine bound to that session and require the session to hold the
/// machine's write lock.
pub trait VirtualizationBackend: Send + Sync {
    /// Get the name of the backend (e.g., "simulated").
    fn name(&self) -> &'static str;

    fn connect(&self, endpoint: &BackendEndpoint, credentials: &Credentials) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    /// Backend product version string.
    fn version(&self) -> Result<String>;

    fn guest_os_types(&self) -> Result<Vec<GuestOsType>>;

    /// All registered machines.
    fn list_machines(&self) -> Result<Vec<MachineInfo>>;

    /// Finds a registered machine by name.
    fn find_machine(&self, name: &str) -> Result<MachineInfo>;

    /// Creates an unregistered machine object.
    fn create_machine(&self, name: &str, os_type: &str, flags: &CreateFlags)
        -> Result<MachineInfo>;

    /// Applies settings to a machine that has not been registered yet.
    fn set_base_settings(&self, machine: &MachineId, settings: &BaseSettings) -> Result<()>;

    fn register_machine(&self, machine: &MachineId) -> Result<()>;

    fn create_session(&self) -> Result<SessionId>;

    fn lock_machine(&self, session: &SessionId, machine: &MachineId, mode: LockMode)
        -> Result<()>;

    /// Unlocks the session's machine and ends the session.
    fn unlock_machine(&self, session: &SessionId) -> Result<()>;

    /// Ends a session whatever its state, releasing any lock it still holds.
    /// Unknown sessions are ignored.
    fn close_session(&self, session: &SessionId) -> Result<()>;

    fn create_medium(
        &self,
        format: &str,
        location: &str,
        access: AccessMode,
        device_type: DeviceType,
    ) -> Result<MediumInfo>;

    /// Allocates backing storage for a medium created with `create_medium`.
    fn create_base_storage(
        &self,
        medium: &MediumId,
        size_bytes: u64,
        variant: MediumVariant,
    ) -> Result<Arc<dyn BackendProgress>>;

    fn open_medium(
        &self,
        location: &str,
        device_type: DeviceType,
        access: AccessMode,
        force_new_uuid: bool,
    ) -> Result<MediumInfo>;

    fn add_storage_controller(&self, session: &SessionId, name: &str, bus: StorageBus)
        -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn attach_device(
        &self,
        session: &SessionId,
        controller: &str,
        port: u32,
        device: u32,
        device_type: DeviceType,
        medium: Option<&MediumId>,
    ) -> Result<()>;

    /// Sets boot slot `position` (1-based); `None` clears the slot.
    fn set_boot_order(
        &self,
        session: &SessionId,
        position: u32,
        device_type: Option<DeviceType>,
    ) -> Result<()>;

    fn set_memory_size(&self, session: &SessionId, memory_mb: u64) -> Result<()>;

    fn save_settings(&self, session: &SessionId) -> Result<()>;

    /// Unregisters a machine, returning detached media according to `mode`.
    fn unregister_machine(&self, machine: &MachineId, mode: CleanupMode)
        -> Result<Vec<MediumInfo>>;

    /// Deletes the settings of an unregistered machine and the storage of `media`.
    fn delete_config(&self, machine: &MachineId, media: &[MediumId]) -> Result<()>;

    /// Powers down the VM the session is linked to.
    fn power_down(&self, session: &SessionId) -> Result<Arc<dyn BackendProgress>>;

    /// Spawns a VM process for `machine`, binding it to `session`.
    fn launch_process(
        &self,
        session: &SessionId,
        machine: &MachineId,
        mode: LaunchMode,
        env: &[String],
    ) -> Result<Arc<dyn BackendProgress>>;

    /// Processes queued backend events, waiting at most `timeout_ms`.
    fn service_events(&self, timeout_ms: u64) -> Result<()>;
}

/// Creates a backend instance for an endpoint.
///
/// # Arguments
/// * `endpoint` - The parsed endpoint; its scheme selects the implementation
///
/// # Returns
/// A shared backend handle or an error if no implementation serves the endpoint.
pub fn get_backend(endpoint: &BackendEndpoint) -> Result<Arc<dyn VirtualizationBackend>> {
    match endpoint.kind() {
        #[cfg(feature = "simulated")]
        BackendKind::Simulated => Ok(Arc::new(simulated::SimulatedBackend::new())),
        #[cfg(not(feature = "simulated"))]
        BackendKind::Simulated => Err(ProviderError::UnknownBackend(format!(
            "{endpoint} (built without the `simulated` feature)"
        ))),
        BackendKind::WebService => Err(ProviderError::UnknownBackend(format!(
            "no web-service transport is linked into this build for {endpoint}"
        ))),
    }
}
