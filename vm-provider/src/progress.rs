//! Backend-side progress objects for asynchronous operations.

use vm_core::error::ErrorDetail;

/// Error information attached to a failed backend operation.
///
/// Backends hand these out as a singly-linked list: the head is the most
/// specific cause and `next` walks towards the least specific one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub text: String,
    pub result_code: i32,
    pub component: String,
    pub interface_id: String,
    pub next: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(
        text: impl Into<String>,
        result_code: i32,
        component: impl Into<String>,
        interface_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            result_code,
            component: component.into(),
            interface_id: interface_id.into(),
            next: None,
        }
    }

    /// Builds a linked chain from records ordered most specific first.
    pub fn from_details(details: &[ErrorDetail]) -> Option<Self> {
        details.iter().rev().fold(None, |next, detail| {
            Some(ErrorInfo {
                text: detail.message.clone(),
                result_code: detail.result_code,
                component: detail.component.clone(),
                interface_id: detail.interface_id.clone(),
                next: next.map(Box::new),
            })
        })
    }

    pub fn next(&self) -> Option<&ErrorInfo> {
        self.next.as_deref()
    }

    pub fn iter(&self) -> ErrorInfoIter<'_> {
        ErrorInfoIter {
            current: Some(self),
        }
    }

    /// Flattens the chain into owned records, preserving order.
    pub fn to_details(&self) -> Vec<ErrorDetail> {
        self.iter()
            .map(|info| {
                ErrorDetail::new(
                    info.text.clone(),
                    info.result_code,
                    info.component.clone(),
                    info.interface_id.clone(),
                )
            })
            .collect()
    }
}

pub struct ErrorInfoIter<'a> {
    current: Option<&'a ErrorInfo>,
}

impl<'a> Iterator for ErrorInfoIter<'a> {
    type Item = &'a ErrorInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = current.next();
        Some(current)
    }
}

/// A pending asynchronous operation as exposed by the backend.
///
/// Completion is only observed after the backend has been serviced
/// (see [`crate::VirtualizationBackend::service_events`]).
pub trait BackendProgress: Send + Sync {
    fn description(&self) -> String;

    fn completed(&self) -> bool;

    /// Percentage in `0..=100`.
    fn percent(&self) -> u32;

    /// Result code once completed; `None` while still running.
    fn result_code(&self) -> Option<i32>;

    /// Error chain head if the operation completed with an error.
    fn error_info(&self) -> Option<ErrorInfo>;

    fn cancelable(&self) -> bool;

    /// Requests cancellation. Returns `false` if the operation cannot be canceled.
    fn cancel(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_core::error::result_code;

    fn chain() -> Vec<ErrorDetail> {
        vec![
            ErrorDetail::new("VD: file exists", result_code::VBOX_E_FILE_ERROR, "VD", "{1}"),
            ErrorDetail::new("Could not create storage", result_code::E_FAIL, "Medium", "{2}"),
            ErrorDetail::new("Progress failed", result_code::E_FAIL, "Progress", "{3}"),
        ]
    }

    #[test]
    fn test_linked_chain_preserves_order() {
        let head = ErrorInfo::from_details(&chain()).unwrap();
        let texts: Vec<&str> = head.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["VD: file exists", "Could not create storage", "Progress failed"]
        );
        assert!(head.next().unwrap().next().unwrap().next().is_none());
    }

    #[test]
    fn test_to_details_roundtrip() {
        let details = chain();
        let head = ErrorInfo::from_details(&details).unwrap();
        assert_eq!(head.to_details(), details);
    }

    #[test]
    fn test_empty_chain() {
        assert!(ErrorInfo::from_details(&[]).is_none());
    }
}
