//! Shared primitives for the VM lifecycle workspace.
//!
//! Everything here is consumed by both the backend abstraction (`vm-provider`)
//! and the orchestration layer (`vm-orchestrator`): identifiers, the device and
//! lock enums that cross the backend boundary, and the error records used to
//! carry backend cause chains.

pub mod error;
pub mod ids;
pub mod types;

pub use error::{ErrorDetail, Result, VmError};
pub use ids::{MachineId, MediumId, SessionId};
pub use types::{
    AccessMode, CleanupMode, DeviceType, GraphicsController, LaunchMode, LockMode, MediumVariant,
    StorageBus,
};
