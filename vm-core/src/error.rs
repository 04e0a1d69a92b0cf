pub use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// General errors shared by the configuration and logging crates.
#[derive(Error, Debug)]
pub enum VmError {
    Config(String),
    Io(#[from] std::io::Error),
    Internal(String),
    Serialization(String),
    Other(#[from] anyhow::Error),
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            VmError::Config(s) => write!(f, "Configuration error: {}", s),
            VmError::Io(e) => write!(f, "I/O error: {}", e),
            VmError::Internal(s) => write!(f, "Internal error: {}", s),
            VmError::Serialization(s) => write!(f, "Serialization error: {}", s),
            VmError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl From<serde_yaml_ng::Error> for VmError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        VmError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VmError {
    fn from(err: serde_json::Error) -> Self {
        VmError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VmError>;

/// Well-known result codes reported by hypervisor backends.
///
/// Codes are COM-style `HRESULT`s and are stored as `i32`, so the high bit
/// makes every failure code negative.
pub mod result_code {
    pub const S_OK: i32 = 0;
    pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
    pub const E_ACCESSDENIED: i32 = 0x8007_0005_u32 as i32;
    pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;
    pub const E_ABORT: i32 = 0x8000_4004_u32 as i32;
    pub const VBOX_E_OBJECT_NOT_FOUND: i32 = 0x80BB_0001_u32 as i32;
    pub const VBOX_E_INVALID_VM_STATE: i32 = 0x80BB_0002_u32 as i32;
    pub const VBOX_E_VM_ERROR: i32 = 0x80BB_0003_u32 as i32;
    pub const VBOX_E_FILE_ERROR: i32 = 0x80BB_0004_u32 as i32;
    pub const VBOX_E_IPRT_ERROR: i32 = 0x80BB_0005_u32 as i32;
    pub const VBOX_E_INVALID_OBJECT_STATE: i32 = 0x80BB_0007_u32 as i32;
    pub const VBOX_E_OBJECT_IN_USE: i32 = 0x80BB_000C_u32 as i32;

    /// Formats a result code the way backend logs print it (`0x80bb0001`).
    pub fn to_hex(code: i32) -> String {
        format!("{:#010x}", code as u32)
    }

    /// Failure codes have the severity bit set.
    pub fn is_failure(code: i32) -> bool {
        code < 0
    }
}

/// One record of a backend error cause chain.
///
/// Chains are ordered from the most specific cause to the least specific one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub result_code: i32,
    /// Backend component that raised the error (e.g. `"MachineWrap"`).
    pub component: String,
    /// Identity of the interface the failing call was made on.
    pub interface_id: String,
}

impl ErrorDetail {
    pub fn new(
        message: impl Into<String>,
        result_code: i32,
        component: impl Into<String>,
        interface_id: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            result_code,
            component: component.into(),
            interface_id: interface_id.into(),
        }
    }
}

impl Display for ErrorDetail {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} (result code {}, component {}, interface {})",
            self.message,
            result_code::to_hex(self.result_code),
            self.component,
            self.interface_id
        )
    }
}

/// Renders a cause chain as numbered lines, one record per line.
pub fn format_chain(details: &[ErrorDetail]) -> String {
    details
        .iter()
        .enumerate()
        .map(|(i, detail)| format!("#{} {}", i + 1, detail))
        .collect::<Vec<_>>()
        .join("\n")
}
