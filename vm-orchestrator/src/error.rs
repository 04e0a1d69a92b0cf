use thiserror::Error;
use vm_core::error::{format_chain, result_code, ErrorDetail};
use vm_core::VmError;
use vm_provider::ProviderError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Category of an [`OrchestratorError`], for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateName,
    NotFound,
    LockConflict,
    LockRequired,
    InvalidHandle,
    Timeout,
    Connection,
    BackendOperationFailed,
    Config,
    InvalidState,
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Machine already exists: {0}")]
    DuplicateName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Write lock required: {0}")]
    LockRequired(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Timed out after {timeout_ms} ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend operation failed ({}): {message}", result_code::to_hex(*.code))]
    BackendOperationFailed {
        code: i32,
        message: String,
        details: Vec<ErrorDetail>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A failure whose compensating cleanup also failed. Reports as `primary`.
    #[error("{primary} (cleanup also failed: {cleanup})")]
    WithCleanupFailure {
        primary: Box<OrchestratorError>,
        cleanup: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateName(_) => ErrorKind::DuplicateName,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::LockConflict(_) => ErrorKind::LockConflict,
            Self::LockRequired(_) => ErrorKind::LockRequired,
            Self::InvalidHandle(_) => ErrorKind::InvalidHandle,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Connection(_) => ErrorKind::Connection,
            Self::BackendOperationFailed { .. } => ErrorKind::BackendOperationFailed,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::WithCleanupFailure { primary, .. } => primary.kind(),
        }
    }

    /// Backend result code, when the error came from the backend.
    pub fn result_code(&self) -> Option<i32> {
        match self {
            Self::BackendOperationFailed { code, .. } => Some(*code),
            Self::WithCleanupFailure { primary, .. } => primary.result_code(),
            _ => None,
        }
    }

    /// Cause chain, most specific record first.
    ///
    /// For a failed cleanup the cleanup chain follows the primary one.
    pub fn details(&self) -> Vec<ErrorDetail> {
        match self {
            Self::BackendOperationFailed { details, .. } => details.clone(),
            Self::WithCleanupFailure { primary, cleanup } => {
                let mut details = primary.details();
                details.extend(cleanup.details());
                details
            }
            _ => Vec::new(),
        }
    }

    /// The original error, looking through an appended cleanup failure.
    pub fn primary(&self) -> &OrchestratorError {
        match self {
            Self::WithCleanupFailure { primary, .. } => primary.primary(),
            other => other,
        }
    }

    pub fn cleanup_failure(&self) -> Option<&OrchestratorError> {
        match self {
            Self::WithCleanupFailure { cleanup, .. } => Some(cleanup),
            _ => None,
        }
    }

    /// Appends a failed cleanup to this error without replacing it.
    pub fn with_cleanup_failure(self, cleanup: OrchestratorError) -> Self {
        Self::WithCleanupFailure {
            primary: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// Multi-line report: the message followed by the numbered cause chain.
    pub fn report(&self) -> String {
        let details = self.details();
        if details.is_empty() {
            self.to_string()
        } else {
            format!("{}\n{}", self, format_chain(&details))
        }
    }

    /// Convert orchestrator error to user-friendly message with suggestions
    pub fn user_friendly(&self) -> String {
        match self.primary() {
            Self::LockConflict(_) => format!(
                "{}\n💡 Another session holds the machine; retry once it is released",
                self
            ),
            Self::LockRequired(_) => format!(
                "{}\n💡 Acquire a write lock on the machine before changing its configuration",
                self
            ),
            Self::Timeout { .. } => format!(
                "{}\n💡 The operation is still running; await it again or cancel it",
                self
            ),
            Self::Connection(_) => format!(
                "{}\n💡 Check the endpoint and credentials in ~/.vm/orchestrator.yaml",
                self
            ),
            _ => self.report(),
        }
    }
}

impl From<ProviderError> for OrchestratorError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ObjectNotFound(msg) => Self::NotFound(msg),
            ProviderError::AlreadyExists(msg) => Self::DuplicateName(msg),
            ProviderError::Connection(msg) => Self::Connection(msg),
            ProviderError::NotConnected => {
                Self::Connection("not connected to a backend".to_string())
            }
            ProviderError::UnknownBackend(msg) => Self::Config(format!("Unknown backend: {msg}")),
            ProviderError::InvalidEndpoint(msg) => {
                Self::Config(format!("Invalid endpoint: {msg}"))
            }
            other => Self::BackendOperationFailed {
                code: other.result_code(),
                message: other.to_string(),
                details: other.details(),
            },
        }
    }
}

impl From<VmError> for OrchestratorError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Config(msg) => Self::Config(msg),
            other => Self::Config(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_failure() -> OrchestratorError {
        OrchestratorError::BackendOperationFailed {
            code: result_code::VBOX_E_FILE_ERROR,
            message: "could not create storage".into(),
            details: vec![
                ErrorDetail::new("disk full", result_code::VBOX_E_FILE_ERROR, "VD", "{1}"),
                ErrorDetail::new("could not create storage", result_code::E_FAIL, "Medium", "{2}"),
            ],
        }
    }

    #[test]
    fn test_display_shows_hex_code() {
        assert_eq!(
            backend_failure().to_string(),
            "Backend operation failed (0x80bb0004): could not create storage"
        );
    }

    #[test]
    fn test_cleanup_failure_keeps_primary_kind() {
        let err = backend_failure()
            .with_cleanup_failure(OrchestratorError::LockConflict("vmA".into()));

        assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);
        assert_eq!(err.result_code(), Some(result_code::VBOX_E_FILE_ERROR));
        assert!(err.cleanup_failure().is_some());
        assert!(err.to_string().contains("cleanup also failed"));
        assert_eq!(err.details().len(), 2);
    }

    #[test]
    fn test_provider_error_mapping() {
        let not_found: OrchestratorError = ProviderError::ObjectNotFound("vmA".into()).into();
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let dup: OrchestratorError = ProviderError::AlreadyExists("vmA".into()).into();
        assert_eq!(dup.kind(), ErrorKind::DuplicateName);

        let offline: OrchestratorError = ProviderError::NotConnected.into();
        assert_eq!(offline.kind(), ErrorKind::Connection);

        let state: OrchestratorError =
            ProviderError::InvalidVmState("machine is running".into()).into();
        assert_eq!(
            state.result_code(),
            Some(result_code::VBOX_E_INVALID_VM_STATE)
        );
        assert_eq!(state.details().len(), 1);
    }

    #[test]
    fn test_report_numbers_chain() {
        let report = backend_failure().report();
        assert!(report.contains("#1 disk full"));
        assert!(report.contains("#2 could not create storage"));
    }

    #[test]
    fn test_user_friendly_hint() {
        let err = OrchestratorError::LockRequired("vmA".into());
        assert!(err.user_friendly().contains("💡"));
    }
}
