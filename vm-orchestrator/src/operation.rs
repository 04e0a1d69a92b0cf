use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// One composite lifecycle operation as recorded in the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub machine_name: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Provision,
    Start,
    Stop,
    Destroy,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Provision => "provision",
            OperationType::Start => "start",
            OperationType::Stop => "stop",
            OperationType::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// In-memory, append-only record of lifecycle operations.
#[derive(Clone, Default)]
pub struct OperationLog {
    entries: Arc<Mutex<Vec<Operation>>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of an operation and returns its id.
    pub fn begin(&self, machine_name: &str, operation_type: OperationType) -> String {
        let id = Uuid::new_v4().to_string();
        let operation = Operation {
            id: id.clone(),
            machine_name: machine_name.to_string(),
            operation_type,
            status: OperationStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(operation);
        }
        id
    }

    /// Marks an operation finished with the outcome of `result`.
    pub fn finish<T>(&self, id: &str, result: &Result<T>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if let Some(operation) = entries.iter_mut().find(|op| op.id == id) {
            operation.completed_at = Some(Utc::now());
            match result {
                Ok(_) => operation.status = OperationStatus::Success,
                Err(e) => {
                    operation.status = OperationStatus::Failed;
                    operation.error = Some(e.to_string());
                }
            }
        }
    }

    /// All operations, oldest first.
    pub fn list(&self) -> Vec<Operation> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn for_machine(&self, machine_name: &str) -> Vec<Operation> {
        self.list()
            .into_iter()
            .filter(|op| op.machine_name == machine_name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;

    #[test]
    fn test_begin_and_finish() {
        let log = OperationLog::new();
        let ok = log.begin("vmA", OperationType::Provision);
        let failed = log.begin("vmB", OperationType::Start);

        log.finish::<()>(&ok, &Ok(()));
        log.finish::<()>(
            &failed,
            &Err(OrchestratorError::NotFound("vmB".into())),
        );

        let ops = log.list();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].status, OperationStatus::Success);
        assert!(ops[0].completed_at.is_some());
        assert_eq!(ops[1].status, OperationStatus::Failed);
        assert!(ops[1].error.as_deref().unwrap_or("").contains("vmB"));
    }

    #[test]
    fn test_unfinished_operation_stays_running() {
        let log = OperationLog::new();
        log.begin("vmA", OperationType::Stop);
        let ops = log.for_machine("vmA");
        assert_eq!(ops[0].status, OperationStatus::Running);
        assert!(log.for_machine("vmB").is_empty());
    }

    #[test]
    fn test_operation_serializes_lowercase() {
        let json = serde_json::to_string(&OperationType::Destroy).unwrap();
        assert_eq!(json, "\"destroy\"");
    }
}
