use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::context::{OperationId, RecoveryContext, Severity};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Retry,
    Circuit,
    Compensation,
    Rollback,
    Saga,
    Transaction,
    AgentRecovery,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Recovered,
    Degraded,
    Rejected,
    Failed,
}

/// One recovery attempt, as seen by an observability sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub operation_id: OperationId,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub operation_type: String,
    pub severity: Severity,
    pub retry_count: u32,
    pub elapsed_ms: i64,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn for_attempt(
        context: &RecoveryContext,
        event_type: impl Into<String>,
        category: AuditCategory,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        let occurred_at = Utc::now();
        Self {
            event_id: Uuid::new_v4().to_string(),
            operation_id: context.operation_id.clone(),
            event_type: event_type.into(),
            category,
            actor: actor.into(),
            outcome,
            operation_type: context.operation_type.as_str().to_owned(),
            severity: context.severity,
            retry_count: context.retry_count,
            elapsed_ms: context.elapsed_at(occurred_at).num_milliseconds(),
            metadata: BTreeMap::new(),
            occurred_at,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Forwards audit events to `tracing` as structured records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        match event.outcome {
            AuditOutcome::Recovered | AuditOutcome::Degraded => tracing::info!(
                event_name = %event.event_type,
                operation_id = %event.operation_id,
                operation_type = %event.operation_type,
                actor = %event.actor,
                outcome = ?event.outcome,
                severity = %event.severity,
                retry_count = event.retry_count,
                elapsed_ms = event.elapsed_ms,
                metadata = %metadata,
                "recovery attempt"
            ),
            AuditOutcome::Rejected | AuditOutcome::Failed => tracing::warn!(
                event_name = %event.event_type,
                operation_id = %event.operation_id,
                operation_type = %event.operation_type,
                actor = %event.actor,
                outcome = ?event.outcome,
                severity = %event.severity,
                retry_count = event.retry_count,
                elapsed_ms = event.elapsed_ms,
                metadata = %metadata,
                "recovery attempt"
            ),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
