use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::Fault;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    DatabaseRead,
    DatabaseWrite,
    LlmRequest,
    WebsocketSend,
    FileOperation,
    ExternalApi,
    AgentExecution,
    CacheOperation,
}

impl OperationType {
    pub const ALL: [OperationType; 8] = [
        Self::DatabaseRead,
        Self::DatabaseWrite,
        Self::LlmRequest,
        Self::WebsocketSend,
        Self::FileOperation,
        Self::ExternalApi,
        Self::AgentExecution,
        Self::CacheOperation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabaseRead => "database_read",
            Self::DatabaseWrite => "database_write",
            Self::LlmRequest => "llm_request",
            Self::WebsocketSend => "websocket_send",
            Self::FileOperation => "file_operation",
            Self::ExternalApi => "external_api",
            Self::AgentExecution => "agent_execution",
            Self::CacheOperation => "cache_operation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == normalized)
    }

    pub fn is_database(&self) -> bool {
        matches!(self, Self::DatabaseRead | Self::DatabaseWrite)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a failure. Ordered so that `Critical` compares greatest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed operation attempt travelling down the recovery chain.
///
/// Created by whichever component first observes the failure and owned by a
/// single caller at a time; retry helpers take it by `&mut` to bump
/// `retry_count`.
#[derive(Clone, Debug)]
pub struct RecoveryContext {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub fault: Fault,
    pub severity: Severity,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
}

impl RecoveryContext {
    pub fn new(operation_type: OperationType, fault: Fault) -> Self {
        Self {
            operation_id: OperationId::generate(),
            operation_type,
            fault,
            severity: Severity::Medium,
            retry_count: 0,
            max_retries: 3,
            started_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_operation_id(mut self, operation_id: OperationId) -> Self {
        self.operation_id = operation_id;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn elapsed_time(&self) -> Duration {
        self.elapsed_at(Utc::now())
    }

    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Resource key used to pick a circuit breaker: an explicit `resource`
    /// metadata entry, or the operation type.
    pub fn resource_key(&self) -> String {
        self.metadata_str("resource")
            .map(str::to_owned)
            .unwrap_or_else(|| self.operation_type.as_str().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::{OperationType, RecoveryContext, Severity};
    use crate::errors::Fault;

    #[test]
    fn operation_type_parse_accepts_snake_case_names() {
        assert_eq!(OperationType::parse("DATABASE_WRITE"), Some(OperationType::DatabaseWrite));
        assert_eq!(OperationType::parse(" llm_request "), Some(OperationType::LlmRequest));
        assert_eq!(OperationType::parse("teleport"), None);
    }

    #[test]
    fn elapsed_time_is_measured_from_started_at() {
        let context = RecoveryContext::new(OperationType::ExternalApi, Fault::timeout("slow"));
        let later = context.started_at + Duration::seconds(7);

        assert_eq!(context.elapsed_at(later), Duration::seconds(7));
    }

    #[test]
    fn resource_key_prefers_metadata() {
        let context = RecoveryContext::new(OperationType::ExternalApi, Fault::timeout("slow"))
            .with_metadata("resource", "billing-api");
        assert_eq!(context.resource_key(), "billing-api");

        let bare = RecoveryContext::new(OperationType::LlmRequest, Fault::timeout("slow"));
        assert_eq!(bare.resource_key(), "llm_request");
    }

    #[test]
    fn severity_orders_critical_highest() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low < Severity::Medium);
    }
}
