//! Virtual machine lifecycle orchestration.
//!
//! Drives machines through provision, start, stop and destroy on top of a
//! [`vm_provider::VirtualizationBackend`]. The building blocks are usable on
//! their own:
//!
//! - [`SessionLock`]: write/shared configuration locks with conflict detection
//! - [`ProgressTracker`]: awaiting long-running backend operations with timeouts
//! - [`MachineRegistry`]: name lookup, configuration changes and the media catalog
//! - [`LifecycleOrchestrator`]: the composite operations, with rollback

pub mod error;
pub mod lifecycle;
pub mod machine;
pub mod media;
pub mod operation;
pub mod progress;
pub mod registry;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{ErrorKind, OrchestratorError, Result};
pub use lifecycle::{DestroyReport, LifecycleOrchestrator};
pub use machine::{Attachment, BaseConfig, Machine, MachineState, StorageController};
pub use media::{MediumAttachment, StorageMedium};
pub use operation::{Operation, OperationLog, OperationStatus, OperationType};
pub use progress::{PollStatus, ProgressHandle, ProgressKind, ProgressTracker};
pub use registry::MachineRegistry;
pub use session::{LockHolders, SessionHandle, SessionLock};
