pub mod context;
pub mod operation;

pub use context::{OperationId, OperationType, RecoveryContext, Severity};
pub use operation::{Operation, OperationState, Transaction, TransactionId, TransactionState};
