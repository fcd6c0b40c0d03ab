use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::agents::{AgentRecoveryConfig, AgentType, FailureAssessment};
use crate::domain::context::RecoveryContext;
use crate::errors::RecoveryError;

/// One agent's escalation ladder. Each rung returns `None` when it cannot
/// produce a usable result.
#[async_trait]
pub trait AgentRecoveryStrategy: Send + Sync {
    fn agent_type(&self) -> AgentType;

    fn config(&self) -> &AgentRecoveryConfig;

    fn assess_failure(&self, context: &RecoveryContext) -> FailureAssessment;

    async fn execute_primary_recovery(
        &self,
        context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value>;

    async fn execute_fallback_recovery(
        &self,
        context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value>;

    async fn execute_degraded_mode(
        &self,
        context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryRung {
    Primary,
    Fallback,
    Degraded,
}

impl RecoveryRung {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Degraded => "degraded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationResult {
    pub payload: Value,
    pub rung: RecoveryRung,
    pub assessment: FailureAssessment,
}

/// Walks primary, fallback and degraded rungs; the first non-empty result
/// wins and lower rungs are never invoked.
///
/// When every rung comes back empty the original fault is returned as the
/// source of [`RecoveryError::AgentRecoveryFailed`], after a manual
/// intervention record if the agent requires one.
pub async fn run_escalation(
    strategy: &dyn AgentRecoveryStrategy,
    context: &RecoveryContext,
) -> Result<EscalationResult, RecoveryError> {
    let agent_type = strategy.agent_type();
    let config = strategy.config();
    let assessment = strategy.assess_failure(context);

    info!(
        event_name = "recovery.agent.assessed",
        operation_id = %context.operation_id,
        agent_type = %agent_type,
        failure_type = %assessment.failure_type,
        severity = %context.severity,
        retry_count = context.retry_count,
        data_integrity_risk = assessment.data_integrity_risk,
        cascade_impact = assessment.cascade_impact,
        "agent failure assessed"
    );

    if assessment.try_primary_recovery {
        if let Some(payload) = strategy.execute_primary_recovery(context, &assessment).await {
            return Ok(recovered(context, agent_type, payload, RecoveryRung::Primary, assessment));
        }
    }

    if assessment.try_fallback_recovery && config.fallback_enabled {
        if let Some(payload) = strategy.execute_fallback_recovery(context, &assessment).await {
            return Ok(recovered(context, agent_type, payload, RecoveryRung::Fallback, assessment));
        }
    }

    if assessment.try_degraded_mode && (config.allow_degraded_mode || assessment.degraded_safe) {
        if let Some(payload) = strategy.execute_degraded_mode(context, &assessment).await {
            return Ok(recovered(context, agent_type, payload, RecoveryRung::Degraded, assessment));
        }
    }

    if config.require_manual_intervention {
        let assessment_json = serde_json::to_string(&assessment).unwrap_or_default();
        error!(
            event_name = "recovery.manual_intervention_required",
            operation_id = %context.operation_id,
            agent_type = %agent_type,
            error = %context.fault,
            assessment = %assessment_json,
            priority = config.priority.as_str(),
            "manual intervention required"
        );
    }

    warn!(
        event_name = "recovery.agent.exhausted",
        operation_id = %context.operation_id,
        agent_type = %agent_type,
        failure_type = %assessment.failure_type,
        elapsed_ms = context.elapsed_time().num_milliseconds(),
        "all recovery rungs exhausted"
    );
    Err(RecoveryError::AgentRecoveryFailed {
        agent_type,
        operation_id: context.operation_id.clone(),
        cause: context.fault.clone(),
    })
}

fn recovered(
    context: &RecoveryContext,
    agent_type: AgentType,
    payload: Value,
    rung: RecoveryRung,
    assessment: FailureAssessment,
) -> EscalationResult {
    info!(
        event_name = "recovery.agent.recovered",
        operation_id = %context.operation_id,
        agent_type = %agent_type,
        rung = rung.as_str(),
        failure_type = %assessment.failure_type,
        elapsed_ms = context.elapsed_time().num_milliseconds(),
        "agent recovered"
    );
    EscalationResult { payload, rung, assessment }
}

/// `context.metadata[key]` as a string, if present.
pub(crate) fn metadata_string(context: &RecoveryContext, key: &str) -> Option<String> {
    context.metadata_str(key).map(str::to_owned)
}
