use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::AgentType;
use crate::domain::context::OperationId;
use crate::domain::operation::TransactionId;
use crate::rollback::SessionId;
use crate::saga::SagaId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Timeout,
    Connection,
    Validation,
    TypeMismatch,
    Permission,
    NotFound,
    Memory,
    Constraint,
    Http,
    Runtime,
    Coordination,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Validation => "validation",
            Self::TypeMismatch => "type_mismatch",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::Memory => "memory",
            Self::Constraint => "constraint",
            Self::Http => "http",
            Self::Runtime => "runtime",
            Self::Coordination => "coordination",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failure that triggered recovery.
///
/// Cheap to clone so it can travel with a `RecoveryContext` and still be
/// attached as the `source` of the error a caller finally receives.
#[derive(Clone, Debug)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    pub status_code: Option<u16>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), status_code: None, source: None }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Connection, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Validation, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Runtime, message)
    }

    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Http, message).with_status(status_code)
    }

    pub fn from_error<E>(kind: FaultKind, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { kind, message: error.to_string(), status_code: None, source: Some(Arc::new(error)) }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_source<E>(mut self, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(error));
        self
    }

    /// Case-insensitive substring check against the message.
    pub fn mentions(&self, needle: &str) -> bool {
        self.message.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
    }

    pub fn mentions_any(&self, needles: &[&str]) -> bool {
        let message = self.message.to_ascii_lowercase();
        needles.iter().any(|needle| message.contains(needle))
    }

    /// Returns the subset of `terms` found in the message, in the order given.
    pub fn matched_terms<'a>(&self, terms: &[&'a str]) -> Vec<&'a str> {
        let message = self.message.to_ascii_lowercase();
        terms.iter().copied().filter(|term| message.contains(term)).collect()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{} ({status}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|error| error as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("circuit breaker open for `{resource}`, retry after {retry_after_secs}s")]
    CircuitOpen { resource: String, retry_after_secs: u64, operation_id: OperationId },
    #[error("unknown agent type `{0}`")]
    UnknownAgentType(String),
    #[error("recovery failed for {agent_type} agent (operation {operation_id})")]
    AgentRecoveryFailed {
        agent_type: AgentType,
        operation_id: OperationId,
        #[source]
        cause: Fault,
    },
    #[error("operation {operation_id} could not be recovered")]
    Unrecoverable {
        operation_id: OperationId,
        #[source]
        cause: Fault,
    },
    #[error("transaction {transaction_id} aborted")]
    TransactionAborted {
        transaction_id: TransactionId,
        #[source]
        cause: Fault,
    },
    #[error("transaction not found: {0}")]
    TransactionNotFound(TransactionId),
    #[error("operation {operation_id} not found in transaction {transaction_id}")]
    OperationNotFound { transaction_id: TransactionId, operation_id: OperationId },
    #[error("rollback session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("saga not found: {0}")]
    SagaNotFound(SagaId),
    #[error("invalid rollback data for `{table}`: {reason}")]
    InvalidRollbackData { table: String, reason: String },
    #[error("invalid recovery state: {0}")]
    InvalidState(String),
}

impl RecoveryError {
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            Self::CircuitOpen { operation_id, .. }
            | Self::AgentRecoveryFailed { operation_id, .. }
            | Self::Unrecoverable { operation_id, .. }
            | Self::OperationNotFound { operation_id, .. } => Some(operation_id),
            _ => None,
        }
    }

    pub fn cause(&self) -> Option<&Fault> {
        match self {
            Self::AgentRecoveryFailed { cause, .. }
            | Self::Unrecoverable { cause, .. }
            | Self::TransactionAborted { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn into_interface(self) -> InterfaceError {
        let correlation_id = self
            .operation_id()
            .map(|id| id.0.clone())
            .unwrap_or_else(|| "unassigned".to_owned());
        let message = self.to_string();

        match self {
            Self::CircuitOpen { retry_after_secs, .. } => InterfaceError::ServiceUnavailable {
                message,
                correlation_id,
                retry_after_secs: Some(retry_after_secs),
            },
            Self::UnknownAgentType(_) | Self::InvalidRollbackData { .. } => {
                InterfaceError::BadRequest { message, correlation_id }
            }
            Self::TransactionNotFound(_)
            | Self::OperationNotFound { .. }
            | Self::SessionNotFound(_)
            | Self::SagaNotFound(_) => InterfaceError::NotFound { message, correlation_id },
            Self::AgentRecoveryFailed { cause, .. }
            | Self::Unrecoverable { cause, .. }
            | Self::TransactionAborted { cause, .. } => {
                InterfaceError::from_fault(&cause, message, correlation_id)
            }
            Self::InvalidState(_) => InterfaceError::Internal { message, correlation_id },
        }
    }
}

/// Failure shape handed to an HTTP boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String, retry_after_secs: Option<u64> },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    fn from_fault(fault: &Fault, message: String, correlation_id: String) -> Self {
        match fault.kind {
            FaultKind::Validation | FaultKind::TypeMismatch => {
                Self::BadRequest { message, correlation_id }
            }
            FaultKind::Permission => Self::Forbidden { message, correlation_id },
            FaultKind::NotFound => Self::NotFound { message, correlation_id },
            _ => Self::Internal { message, correlation_id },
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You do not have permission to perform this operation.",
            Self::NotFound { .. } => "The requested resource was not found.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use crate::agents::AgentType;
    use crate::domain::context::OperationId;
    use crate::errors::{Fault, FaultKind, InterfaceError, RecoveryError};

    #[test]
    fn open_circuit_maps_to_service_unavailable_with_retry_after() {
        let interface = RecoveryError::CircuitOpen {
            resource: "POST /v1/optimize".to_owned(),
            retry_after_secs: 42,
            operation_id: OperationId("op-1".to_owned()),
        }
        .into_interface();

        assert_eq!(interface.status_code(), 503);
        assert_eq!(interface.correlation_id(), "op-1");
        assert!(matches!(
            interface,
            InterfaceError::ServiceUnavailable { retry_after_secs: Some(42), .. }
        ));
    }

    #[test]
    fn fault_kinds_map_to_http_statuses() {
        let cases = [
            (FaultKind::Validation, 400),
            (FaultKind::TypeMismatch, 400),
            (FaultKind::Permission, 403),
            (FaultKind::NotFound, 404),
            (FaultKind::Timeout, 500),
        ];

        for (kind, expected) in cases {
            let interface = RecoveryError::Unrecoverable {
                operation_id: OperationId("op-2".to_owned()),
                cause: Fault::new(kind, "boom"),
            }
            .into_interface();
            assert_eq!(interface.status_code(), expected, "kind {kind}");
        }
    }

    #[test]
    fn exhausted_agent_recovery_keeps_original_fault_as_source() {
        let error = RecoveryError::AgentRecoveryFailed {
            agent_type: AgentType::Triage,
            operation_id: OperationId("op-3".to_owned()),
            cause: Fault::timeout("intent detection timed out"),
        };

        let source = error.source().expect("source should be preserved");
        assert!(source.to_string().contains("intent detection timed out"));
        assert_eq!(
            error.into_interface().user_message(),
            "An unexpected internal error occurred."
        );
    }

    #[test]
    fn fault_matches_terms_case_insensitively() {
        let fault = Fault::connection("Connection reset while waiting: TIMEOUT");

        assert!(fault.mentions("timeout"));
        assert_eq!(
            fault.matched_terms(&["connection", "timeout", "memory"]),
            vec!["connection", "timeout"]
        );
    }

    #[test]
    fn fault_display_includes_status_when_present() {
        assert_eq!(Fault::http(503, "upstream down").to_string(), "http (503): upstream down");
    }
}
