use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::compensation::{CompensationExecutor, CompensationState};
use crate::domain::context::{OperationId, RecoveryContext};
use crate::errors::RecoveryError;
use crate::retry::RetryPolicies;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Compensate,
    Abort,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Compensate => "compensate",
            Self::Abort => "abort",
        }
    }
}

/// Decision taken for one failed attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub operation_id: OperationId,
    pub action: RecoveryAction,
    pub success: bool,
    pub strategy: String,
    pub retry_delay: Option<Duration>,
    pub error: Option<String>,
}

/// Generic recovery for failures no agent strategy claims: gate on the
/// circuit breaker, then retry, compensate, or abort.
pub struct RecoveryExecutor {
    policies: RetryPolicies,
    breakers: Arc<CircuitBreakerRegistry>,
    compensation: Arc<CompensationExecutor>,
    audit: Arc<dyn AuditSink>,
}

impl RecoveryExecutor {
    pub fn new(
        policies: RetryPolicies,
        breakers: Arc<CircuitBreakerRegistry>,
        compensation: Arc<CompensationExecutor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { policies, breakers, compensation, audit }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Gates on the breaker for `context.resource_key()`, counts the observed
    /// failure against that resource, then decides.
    ///
    /// A scheduled retry is not a success for the breaker. Callers report a
    /// later successful attempt through [`RecoveryExecutor::record_success`].
    pub async fn attempt_recovery(
        &self,
        context: &RecoveryContext,
    ) -> Result<RecoveryResult, RecoveryError> {
        let resource = context.resource_key();
        self.check_circuit(&resource, context)?;
        self.breakers.record_failure(&resource);

        Ok(self.decide(context).await)
    }

    /// Closes the circuit of `resource` after a successful attempt.
    pub fn record_success(&self, resource: &str) {
        self.breakers.record_success(resource);
    }

    /// Fails with [`RecoveryError::CircuitOpen`] when `resource` is not
    /// admitting requests.
    pub fn check_circuit(
        &self,
        resource: &str,
        context: &RecoveryContext,
    ) -> Result<(), RecoveryError> {
        if self.breakers.should_allow_request(resource) {
            return Ok(());
        }

        let retry_after_secs = self.breakers.retry_after(resource).as_secs().max(1);
        warn!(
            event_name = "recovery.circuit.rejected",
            operation_id = %context.operation_id,
            resource,
            retry_after_secs,
            "circuit open, recovery not attempted"
        );
        self.audit.emit(
            AuditEvent::for_attempt(
                context,
                "recovery.circuit.rejected",
                AuditCategory::Circuit,
                "recovery_executor",
                AuditOutcome::Rejected,
            )
            .with_metadata("resource", resource),
        );
        Err(RecoveryError::CircuitOpen {
            resource: resource.to_owned(),
            retry_after_secs,
            operation_id: context.operation_id.clone(),
        })
    }

    /// Retry if the operation's strategy allows it, otherwise compensate when
    /// a handler exists, otherwise abort. Does not touch circuit breakers.
    pub async fn decide(&self, context: &RecoveryContext) -> RecoveryResult {
        let strategy = self.policies.for_operation(context.operation_type);

        if strategy.should_retry(context) {
            let delay = strategy.get_retry_delay(context.retry_count);
            info!(
                event_name = "recovery.retry.scheduled",
                operation_id = %context.operation_id,
                operation_type = %context.operation_type,
                severity = %context.severity,
                retry_count = context.retry_count,
                delay_ms = delay.as_millis() as u64,
                strategy = strategy.name(),
                "retry scheduled"
            );
            self.audit.emit(
                AuditEvent::for_attempt(
                    context,
                    "recovery.retry.scheduled",
                    AuditCategory::Retry,
                    strategy.name(),
                    AuditOutcome::Recovered,
                )
                .with_metadata("delay_ms", delay.as_millis().to_string()),
            );
            return RecoveryResult {
                operation_id: context.operation_id.clone(),
                action: RecoveryAction::Retry,
                success: true,
                strategy: strategy.name().to_owned(),
                retry_delay: Some(delay),
                error: None,
            };
        }

        let action = self.compensation.registry().create_action(
            context.operation_id.clone(),
            context.operation_type,
            context.metadata.clone(),
        );
        if action.has_handler() {
            let action = self.compensation.execute_action(action).await;
            let success = action.state == CompensationState::Completed;
            self.audit.emit(
                AuditEvent::for_attempt(
                    context,
                    "recovery.compensation.executed",
                    AuditCategory::Compensation,
                    "recovery_executor",
                    if success { AuditOutcome::Recovered } else { AuditOutcome::Failed },
                )
                .with_metadata("action_id", action.action_id.clone()),
            );
            return RecoveryResult {
                operation_id: context.operation_id.clone(),
                action: RecoveryAction::Compensate,
                success,
                strategy: strategy.name().to_owned(),
                retry_delay: None,
                error: action.error.or_else(|| (!success).then(|| context.fault.to_string())),
            };
        }

        warn!(
            event_name = "recovery.aborted",
            operation_id = %context.operation_id,
            operation_type = %context.operation_type,
            severity = %context.severity,
            retry_count = context.retry_count,
            elapsed_ms = context.elapsed_time().num_milliseconds(),
            error = %context.fault,
            "no recovery path, aborting"
        );
        self.audit.emit(AuditEvent::for_attempt(
            context,
            "recovery.aborted",
            AuditCategory::Retry,
            "recovery_executor",
            AuditOutcome::Failed,
        ));
        RecoveryResult {
            operation_id: context.operation_id.clone(),
            action: RecoveryAction::Abort,
            success: false,
            strategy: strategy.name().to_owned(),
            retry_delay: None,
            error: Some(context.fault.to_string()),
        }
    }
}
