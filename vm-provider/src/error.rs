//! Error types for virtualization backend calls.
//!
//! Every variant maps to a backend result code so callers can report the same
//! hex code the backend would have logged.

use thiserror::Error;
use vm_core::error::{result_code, ErrorDetail};

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors raised by a [`crate::VirtualizationBackend`] implementation.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected to a backend")]
    NotConnected,

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid object state: {0}")]
    InvalidObjectState(String),

    #[error("Invalid machine state: {0}")]
    InvalidVmState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation failed: {message}")]
    OperationFailed {
        code: i32,
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProviderError {
    pub fn result_code(&self) -> i32 {
        match self {
            Self::UnknownBackend(_) | Self::InvalidEndpoint(_) | Self::InvalidArgument(_) => {
                result_code::E_INVALIDARG
            }
            Self::Connection(_) | Self::NotConnected => result_code::E_ACCESSDENIED,
            Self::ObjectNotFound(_) => result_code::VBOX_E_OBJECT_NOT_FOUND,
            Self::AlreadyExists(_) => result_code::VBOX_E_FILE_ERROR,
            Self::InvalidObjectState(_) => result_code::VBOX_E_INVALID_OBJECT_STATE,
            Self::InvalidVmState(_) => result_code::VBOX_E_INVALID_VM_STATE,
            Self::OperationFailed { code, .. } => *code,
            Self::IoError(_) => result_code::VBOX_E_IPRT_ERROR,
        }
    }

    /// Cause chain for this error, most specific record first.
    ///
    /// Errors raised synchronously carry no chain of their own, so a single
    /// record describing the error itself is returned.
    pub fn details(&self) -> Vec<ErrorDetail> {
        match self {
            Self::OperationFailed { details, .. } if !details.is_empty() => details.clone(),
            _ => vec![ErrorDetail::new(
                self.to_string(),
                self.result_code(),
                "Backend",
                "",
            )],
        }
    }

    /// Builds an `OperationFailed` from a chain whose head is the primary error.
    pub fn from_chain(details: Vec<ErrorDetail>) -> Self {
        let (code, message) = details
            .first()
            .map(|d| (d.result_code, d.message.clone()))
            .unwrap_or((result_code::E_FAIL, "unspecified backend failure".to_string()));
        Self::OperationFailed {
            code,
            message,
            details,
        }
    }

    /// Convert provider error to user-friendly message with suggestions
    pub fn user_friendly(&self) -> String {
        match self {
            Self::Connection(msg) if msg.contains("refused") => format!(
                "{}\n💡 Start the hypervisor web service first (e.g. `vboxwebsrv`)",
                self
            ),
            Self::Connection(msg) if msg.contains("authentication") => format!(
                "{}\n💡 Check the configured user and password for the endpoint",
                self
            ),
            Self::NotConnected => format!("{}\n💡 Call connect() before issuing requests", self),
            Self::InvalidObjectState(_) => format!(
                "{}\n💡 Another session may hold the machine; close it and retry",
                self
            ),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        assert_eq!(
            ProviderError::ObjectNotFound("vm".into()).result_code(),
            result_code::VBOX_E_OBJECT_NOT_FOUND
        );
        assert_eq!(
            ProviderError::InvalidObjectState("locked".into()).result_code(),
            result_code::VBOX_E_INVALID_OBJECT_STATE
        );
    }

    #[test]
    fn test_details_synthesized_for_simple_errors() {
        let err = ProviderError::ObjectNotFound("vmA".into());
        let details = err.details();
        assert_eq!(details.len(), 1);
        assert!(details[0].message.contains("vmA"));
    }

    #[test]
    fn test_from_chain_uses_head() {
        let err = ProviderError::from_chain(vec![
            ErrorDetail::new("inner", result_code::VBOX_E_FILE_ERROR, "Medium", "{a}"),
            ErrorDetail::new("outer", result_code::E_FAIL, "Progress", "{b}"),
        ]);
        assert_eq!(err.result_code(), result_code::VBOX_E_FILE_ERROR);
        assert_eq!(err.to_string(), "Operation failed: inner");
        assert_eq!(err.details().len(), 2);
    }

    #[test]
    fn test_user_friendly_connection_hint() {
        let err = ProviderError::Connection("connection refused".into());
        assert!(err.user_friendly().contains("💡"));
        let plain = ProviderError::InvalidArgument("port".into());
        assert_eq!(plain.user_friendly(), plain.to_string());
    }
}
