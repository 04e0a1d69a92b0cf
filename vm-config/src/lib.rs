//! Orchestrator configuration library.
//!
//! Two documents are handled here:
//! - [`OrchestratorConfig`]: where the backend lives, how to log in, and the
//!   polling, timeout and retry knobs the lifecycle operations use. Loaded
//!   from `~/.vm/orchestrator.yaml` with `VM_ORCH_*` environment overrides.
//! - [`MachineSpec`]: a provisioning request describing one machine, its
//!   storage controllers, media and boot order.
//!
//! Both are validated before use; failures surface as `VmError::Config`.

pub mod config;
pub mod loader;
pub mod machine;
pub mod validate;

pub use config::{OrchestratorConfig, RetrySettings, TimeoutSettings, DEFAULT_ENDPOINT};
pub use loader::default_config_path;
pub use machine::{AttachmentSpec, ControllerSpec, MachineSpec, MediumSource};
