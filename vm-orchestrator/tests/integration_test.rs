//! Integration tests for vm-orchestrator
//!
//! Drives full machine lifecycles against the simulated backend with tokio's
//! paused clock: provisioning, locking, progress timeouts, rollback and the
//! concurrent same-name case.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use vm_config::{MachineSpec, OrchestratorConfig};
use vm_core::error::{result_code, ErrorDetail};
use vm_core::{DeviceType, LaunchMode, LockMode, MediumVariant, StorageBus};
use vm_orchestrator::{ErrorKind, LifecycleOrchestrator, MachineState, ProgressKind};
use vm_provider::simulated::{Fault, FaultPoint, SimulatedBackend};

fn setup() -> (SimulatedBackend, LifecycleOrchestrator) {
    vm_logging::init_for_tests();

    let backend = SimulatedBackend::new();
    let mut config = OrchestratorConfig::default();
    config.lock_retry.backoff_ms = 50;
    let orchestrator = LifecycleOrchestrator::new(Arc::new(backend.clone()), config);
    orchestrator.connect().expect("Failed to connect to simulated backend");
    (backend, orchestrator)
}

fn machine_spec(name: &str) -> MachineSpec {
    MachineSpec::new(name, "Linux26_64", 2048)
        .with_controller("SATA", StorageBus::Sata)
        .with_new_disk("SATA", 0, format!("/vms/{name}/{name}.vdi"), 16 << 30)
        .with_boot_order(vec![DeviceType::HardDisk, DeviceType::Dvd])
}

#[tokio::test(start_paused = true)]
async fn test_provision_then_find() {
    let (_backend, orch) = setup();

    let vm = assert_ok!(orch.provision(&machine_spec("vmA")).await);
    assert_eq!(vm.state, MachineState::Registered);

    let found = assert_ok!(orch.registry().find("vmA"));
    assert_eq!(found.id, vm.id);
    assert_eq!(found.state, MachineState::Registered);
    assert_eq!(found.memory_mb, 2048);
    assert_eq!(found.os_type, "Linux26_64");
    assert_eq!(
        found.boot_order,
        vec![Some(DeviceType::HardDisk), Some(DeviceType::Dvd)]
    );

    // A fresh registry on the same backend sees the same machine.
    let listed = assert_ok!(orch.list_machines());
    assert_eq!(listed.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lock_conflicts() {
    let (_backend, orch) = setup();
    let vm = assert_ok!(orch.provision(&MachineSpec::new("vmA", "Other", 512)).await);
    let locks = orch.locks();

    let writer = assert_ok!(locks.acquire(&vm.id, LockMode::Write));
    let err = assert_err!(locks.acquire(&vm.id, LockMode::Write));
    assert_eq!(err.kind(), ErrorKind::LockConflict);
    let err = assert_err!(locks.acquire(&vm.id, LockMode::Shared));
    assert_eq!(err.kind(), ErrorKind::LockConflict);
    assert_ok!(locks.release(&writer));

    let first = assert_ok!(locks.acquire(&vm.id, LockMode::Shared));
    let second = assert_ok!(locks.acquire(&vm.id, LockMode::Shared));
    assert_ok!(locks.release(&first));
    assert_ok!(locks.release(&second));

    let err = assert_err!(locks.release(&second));
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_absent_name_succeeds() {
    let (_backend, orch) = setup();

    let report = assert_ok!(orch.destroy("never-created").await);
    assert!(!report.existed);
    assert!(report.removed_media.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_await_never_completing_handle_times_out() {
    let (backend, orch) = setup();
    backend.inject_fault(FaultPoint::CreateBaseStorage, Fault::Hang);

    let medium = assert_ok!(orch
        .registry()
        .create_medium("vdi", "/vms/scratch.vdi", DeviceType::HardDisk));
    let progress = assert_ok!(orch.registry().create_base_storage(
        &medium.id,
        1 << 30,
        MediumVariant::Fixed
    ));
    let handle = orch.tracker().track(progress, ProgressKind::CreateStorage);

    let timeout = Duration::from_millis(750);
    let start = Instant::now();
    let err = assert_err!(orch.tracker().await_completion(&handle, timeout).await);
    let elapsed = start.elapsed();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(elapsed >= timeout);
    assert!(elapsed <= timeout + orch.tracker().poll_interval());

    // The handle is still pending and can be awaited again.
    assert!(!handle.is_completed());
    let err = assert_err!(orch.tracker().await_completion(&handle, timeout).await);
    assert_eq!(err.kind(), ErrorKind::Timeout);

    assert!(orch.tracker().cancel(&handle));
    let err = assert_err!(
        orch.tracker()
            .await_completion(&handle, Duration::from_secs(1))
            .await
    );
    assert_eq!(err.result_code(), Some(result_code::E_ABORT));
    assert!(!backend.file_exists("/vms/scratch.vdi"));
}

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle() {
    let (backend, orch) = setup();

    let vm = assert_ok!(orch.provision(&machine_spec("vmA")).await);
    assert!(backend.file_exists("/vms/vmA/vmA.vdi"));

    let running = assert_ok!(orch.start("vmA", LaunchMode::Headless).await);
    assert_eq!(running.state, MachineState::Running);

    let stopped = assert_ok!(orch.stop("vmA", Duration::from_millis(10_000)).await);
    assert_eq!(stopped.state, MachineState::Registered);

    let report = assert_ok!(orch.destroy("vmA").await);
    assert!(report.existed);
    assert_eq!(report.removed_media.len(), 1);
    assert_eq!(report.removed_media[0].format, "VDI");

    let err = assert_err!(orch.registry().find("vmA"));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(backend.machine_by_name("vmA").is_none());
    assert!(!backend.file_exists("/vms/vmA/vmA.vdi"));
    assert!(orch.registry().get(&vm.id).is_err());
    assert!(orch.tracker().pending().is_empty());
    assert_eq!(orch.operations().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_provision_same_name() {
    let (backend, orch) = setup();
    let spec = machine_spec("vmA");

    let (first, second) = tokio::join!(orch.provision(&spec), orch.provision(&spec));

    let (winner, loser) = match (first, second) {
        (Ok(vm), Err(e)) | (Err(e), Ok(vm)) => (vm, e),
        (a, b) => panic!("expected exactly one success, got {:?} and {:?}", a, b),
    };
    assert_eq!(loser.kind(), ErrorKind::DuplicateName);
    assert_eq!(winner.state, MachineState::Registered);

    // The loser must not have torn down the winner's machine.
    let found = assert_ok!(orch.registry().find("vmA"));
    assert_eq!(found.id, winner.id);
    assert!(backend.file_exists("/vms/vmA/vmA.vdi"));
}

#[tokio::test(start_paused = true)]
async fn test_cause_chain_reported_most_specific_first() {
    let (backend, orch) = setup();
    assert_ok!(orch.provision(&machine_spec("vmA")).await);

    backend.inject_fault(
        FaultPoint::LaunchProcess,
        Fault::Fail(vec![
            ErrorDetail::new(
                "VT-x is disabled in the BIOS for all CPU modes (VERR_VMX_MSR_ALL_VMX_DISABLED)",
                result_code::E_FAIL,
                "ConsoleWrap",
                "{872da645-4a9b-1727-bee2-5585105b9eed}",
            ),
            ErrorDetail::new(
                "The virtual machine 'vmA' has terminated unexpectedly during startup",
                result_code::E_FAIL,
                "MachineWrap",
                "{85632c68-b5bb-4316-a900-5eb28d3413df}",
            ),
            ErrorDetail::new(
                "Failed to start the virtual machine",
                result_code::VBOX_E_VM_ERROR,
                "ProgressWrap",
                "",
            ),
        ]),
    );

    let err = assert_err!(orch.start("vmA", LaunchMode::Headless).await);
    assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);

    let chain = err.details();
    assert_eq!(chain.len(), 3);
    assert!(chain[0].message.contains("VT-x"));
    assert_eq!(chain[1].component, "MachineWrap");
    assert_eq!(chain[2].result_code, result_code::VBOX_E_VM_ERROR);

    let found = assert_ok!(orch.registry().find("vmA"));
    assert_eq!(found.state, MachineState::Registered);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_failure_is_attached_and_retried() {
    let (backend, orch) = setup();
    backend.inject_fault(FaultPoint::SaveSettings, Fault::Fail(vec![]));
    backend.inject_fault(FaultPoint::DeleteConfig, Fault::Fail(vec![]));

    let err = assert_err!(orch.provision(&machine_spec("vmA")).await);
    // Reported as the original failure, with the cleanup failure attached.
    assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);
    assert!(err.cleanup_failure().is_some());
    assert!(err.to_string().contains("cleanup also failed"));

    let pending = orch
        .registry()
        .pending_cleanup("vmA")
        .expect("cleanup should be pending");
    assert_eq!(pending.len(), 1);
    assert!(backend.file_exists("/vms/vmA/vmA.vdi"));

    let report = assert_ok!(orch.destroy("vmA").await);
    assert!(!report.existed);
    assert_eq!(report.removed_media.len(), 1);
    assert!(orch.registry().pending_cleanup("vmA").is_none());
    assert!(!backend.file_exists("/vms/vmA/vmA.vdi"));

    // The name is free again.
    assert_ok!(orch.provision(&machine_spec("vmA")).await);
}

#[tokio::test(start_paused = true)]
async fn test_stop_timeout_keeps_pending_handle() {
    let (backend, orch) = setup();
    assert_ok!(orch.provision(&machine_spec("vmA")).await);
    assert_ok!(orch.start("vmA", LaunchMode::Headless).await);

    // 40 backend ticks at a 100 ms poll interval take about 4 s.
    backend.set_latency(40);
    let err = assert_err!(orch.stop("vmA", Duration::from_secs(1)).await);
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let found = assert_ok!(orch.registry().find("vmA"));
    assert_eq!(found.state, MachineState::Running);
    let pending = orch.pending_operation("vmA").expect("power-down pending");
    assert_eq!(pending.kind(), ProgressKind::PowerDown);

    let stopped = assert_ok!(orch.await_pending("vmA", Duration::from_secs(10)).await);
    assert_eq!(stopped.state, MachineState::Registered);
    assert!(orch.pending_operation("vmA").is_none());

    assert_ok!(orch.destroy("vmA").await);
}

#[tokio::test(start_paused = true)]
async fn test_webservice_endpoint_config_is_rejected_without_transport() {
    let mut config = OrchestratorConfig::default();
    config.endpoint = "https://hypervisor.example:18083".to_string();
    let err = assert_err!(LifecycleOrchestrator::from_config(config).map(|_| ()));
    assert_eq!(err.kind(), ErrorKind::Config);
}

fn second_client(backend: &SimulatedBackend) -> LifecycleOrchestrator {
    let mut config = OrchestratorConfig::default();
    config.lock_retry.backoff_ms = 50;
    config.lock_retry.max_attempts = 2;
    let orchestrator = LifecycleOrchestrator::new(Arc::new(backend.clone()), config);
    orchestrator.connect().expect("Failed to connect second client");
    orchestrator
}

#[tokio::test(start_paused = true)]
async fn test_clients_sharing_a_backend_see_each_others_changes() {
    let (backend, a) = setup();
    let b = second_client(&backend);

    assert_ok!(a.provision(&machine_spec("vmA")).await);
    assert_ok!(a.start("vmA", LaunchMode::Headless).await);

    let stopped = assert_ok!(b.stop("vmA", Duration::from_secs(10)).await);
    assert_eq!(stopped.state, MachineState::Registered);
    assert_eq!(
        assert_ok!(a.registry().find("vmA")).state,
        MachineState::Registered
    );

    // Client A can drive the machine again.
    assert_ok!(a.start("vmA", LaunchMode::Headless).await);
    assert_eq!(
        assert_ok!(b.registry().find("vmA")).state,
        MachineState::Running
    );
    assert_ok!(a.stop("vmA", Duration::from_secs(10)).await);

    let report = assert_ok!(b.destroy("vmA").await);
    assert!(report.existed);

    // Gone for A as well: destroying reports success and the name is reusable.
    let report = assert_ok!(a.destroy("vmA").await);
    assert!(!report.existed);
    let err = assert_err!(a.registry().find("vmA"));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_ok!(a.provision(&machine_spec("vmA")).await);
}

#[tokio::test(start_paused = true)]
async fn test_provision_reuses_name_destroyed_by_other_client() {
    let (backend, a) = setup();
    let b = second_client(&backend);

    let first = assert_ok!(a.provision(&machine_spec("vmA")).await);
    assert_ok!(b.destroy("vmA").await);

    let second = assert_ok!(a.provision(&machine_spec("vmA")).await);
    assert_ne!(second.id, first.id);
    assert_eq!(
        assert_ok!(b.registry().find("vmA")).id,
        second.id
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_time_limit() {
    let (_backend, orch) = setup();
    assert_ok!(orch.provision(&machine_spec("vmA")).await);
    assert_ok!(orch.start("vmA", LaunchMode::Headless).await);

    let stopped = assert_ok!(orch.stop("vmA", Duration::MAX).await);
    assert_eq!(stopped.state, MachineState::Registered);
}

#[tokio::test(start_paused = true)]
async fn test_sessions_are_closed_after_use() {
    let (backend, a) = setup();
    let b = second_client(&backend);

    assert_ok!(a.provision(&machine_spec("vmA")).await);
    assert_ok!(a.start("vmA", LaunchMode::Headless).await);
    assert_eq!(backend.open_sessions(), 0);

    // The backend refuses a write lock while the VM runs.
    let err = assert_err!(b.destroy("vmA").await);
    assert_eq!(err.kind(), ErrorKind::LockConflict);
    assert_eq!(backend.open_sessions(), 0);

    assert_ok!(a.stop("vmA", Duration::from_secs(10)).await);
    assert_ok!(a.destroy("vmA").await);
    assert_eq!(backend.open_sessions(), 0);
    assert!(a.tracker().pending().is_empty());
}
