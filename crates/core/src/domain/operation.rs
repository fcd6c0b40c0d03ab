use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::context::{OperationId, OperationType};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Completed,
    Failed,
    Compensated,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
        }
    }
}

/// A unit of work inside a distributed transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub state: OperationState,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Operation {
    pub fn new(operation_type: OperationType, metadata: BTreeMap<String, Value>) -> Self {
        Self {
            operation_id: OperationId::generate(),
            operation_type,
            state: OperationState::Pending,
            metadata,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn mark_completed(&mut self) {
        self.state = OperationState::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = OperationState::Failed;
        self.error = Some(error.into());
    }

    pub fn mark_compensated(&mut self) {
        self.state = OperationState::Compensated;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub operations: Vec<Operation>,
    pub state: TransactionState,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(metadata: BTreeMap<String, Value>) -> Self {
        Self {
            transaction_id: TransactionId::generate(),
            operations: Vec::new(),
            state: TransactionState::Active,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn operation_mut(&mut self, operation_id: &OperationId) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|operation| &operation.operation_id == operation_id)
    }

    pub fn has_failed_operations(&self) -> bool {
        self.operations.iter().any(|operation| operation.state == OperationState::Failed)
    }

    pub fn completed_operation_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|operation| operation.state == OperationState::Completed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Operation, OperationState, Transaction};
    use crate::domain::context::OperationType;

    #[test]
    fn failed_operation_is_detected() {
        let mut transaction = Transaction::new(BTreeMap::new());
        let mut ok = Operation::new(OperationType::DatabaseWrite, BTreeMap::new());
        ok.mark_completed();
        let mut broken = Operation::new(OperationType::DatabaseWrite, BTreeMap::new());
        broken.mark_failed("unique violation");
        transaction.operations.push(ok);

        assert!(!transaction.has_failed_operations());

        transaction.operations.push(broken);
        assert!(transaction.has_failed_operations());
        assert_eq!(transaction.completed_operation_count(), 1);
    }

    #[test]
    fn completing_an_operation_stamps_completion_time() {
        let mut operation = Operation::new(OperationType::CacheOperation, BTreeMap::new());
        assert!(operation.completed_at.is_none());

        operation.mark_completed();

        assert_eq!(operation.state, OperationState::Completed);
        assert!(operation.completed_at.is_some());
    }
}
