//! Shared fixtures for orchestrator tests.

use std::sync::Arc;
use std::time::Duration;

use vm_config::OrchestratorConfig;
use vm_core::{DeviceType, LockMode, MediumVariant, StorageBus};
use vm_provider::simulated::SimulatedBackend;
use vm_provider::{BackendEndpoint, Credentials, VirtualizationBackend};

use crate::lifecycle::LifecycleOrchestrator;
use crate::machine::{BaseConfig, Machine};
use crate::progress::ProgressTracker;
use crate::registry::MachineRegistry;
use crate::session::SessionLock;

/// Poll interval used by harness trackers.
pub const TEST_POLL_INTERVAL_MS: u64 = 100;

/// Creates a simulated backend that is already connected.
pub fn connected_backend() -> SimulatedBackend {
    let backend = SimulatedBackend::new();
    backend
        .connect(&BackendEndpoint::simulated(), &Credentials::anonymous())
        .expect("simulated backend accepts anonymous connections");
    backend
}

/// Orchestrator configuration with short retry delays for tests.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.poll_interval_ms = TEST_POLL_INTERVAL_MS;
    config.lock_retry.backoff_ms = 50;
    config
}

/// Builds an orchestrator over a connected simulated backend.
pub fn test_orchestrator() -> (SimulatedBackend, LifecycleOrchestrator) {
    let backend = connected_backend();
    let orchestrator = LifecycleOrchestrator::new(Arc::new(backend.clone()), test_config());
    (backend, orchestrator)
}

/// Registry, lock table and tracker wired to one simulated backend.
pub struct TestHarness {
    pub backend: SimulatedBackend,
    pub registry: MachineRegistry,
    pub locks: SessionLock,
    pub tracker: ProgressTracker,
}

impl TestHarness {
    pub fn new() -> Self {
        let backend = connected_backend();
        let shared: Arc<dyn VirtualizationBackend> = Arc::new(backend.clone());
        let registry = MachineRegistry::new(Arc::clone(&shared));
        let locks = SessionLock::new(Arc::clone(&shared), registry.clone());
        let tracker = ProgressTracker::new(
            shared,
            Duration::from_millis(TEST_POLL_INTERVAL_MS),
            0,
        );
        Self {
            backend,
            registry,
            locks,
            tracker,
        }
    }

    pub fn backend_handle(&self) -> Arc<dyn VirtualizationBackend> {
        Arc::new(self.backend.clone())
    }

    /// A registered, powered-off machine with default settings.
    pub fn registered_machine(&self, name: &str) -> Machine {
        let machine = self
            .registry
            .create(name, "Linux26_64", &BaseConfig::default())
            .expect("create machine");
        let machine = self.registry.register(&machine.id).expect("register machine");
        self.registry.end_operation(name);
        machine
    }

    /// A registered machine with a freshly created disk on SATA port 0.
    pub fn machine_with_disk(&self, name: &str, location: &str) -> Machine {
        let machine = self.registered_machine(name);
        let disk = self
            .registry
            .create_medium("vdi", location, DeviceType::HardDisk)
            .expect("create medium");
        let progress = self
            .registry
            .create_base_storage(&disk.id, 1 << 30, MediumVariant::Standard)
            .expect("create base storage");
        for _ in 0..16 {
            if progress.completed() {
                break;
            }
            self.backend.service_events(0).expect("service events");
        }
        assert!(progress.completed(), "storage creation did not finish");
        self.registry
            .mark_storage_created(&disk.id, 1 << 30)
            .expect("mark storage");

        let handle = self
            .locks
            .acquire(&machine.id, LockMode::Write)
            .expect("write lock");
        self.registry
            .add_storage_controller(&handle, "SATA", StorageBus::Sata)
            .expect("add controller");
        self.registry
            .attach_device(&handle, "SATA", 0, 0, DeviceType::HardDisk, Some(&disk.id))
            .expect("attach disk");
        self.registry.save_settings(&handle).expect("save settings");
        self.locks.release(&handle).expect("release lock");
        self.registry.get(&machine.id).expect("machine")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
