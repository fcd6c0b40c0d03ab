use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::strategy::metadata_string;
use crate::agents::{AgentRecoveryConfig, AgentRecoveryStrategy, AgentType, FailureAssessment};
use crate::domain::context::RecoveryContext;

/// Recovery for the orchestrating supervisor. Every failure is treated as a
/// coordination failure that may cascade to sub-agents.
pub struct SupervisorRecoveryStrategy {
    config: AgentRecoveryConfig,
}

impl Default for SupervisorRecoveryStrategy {
    fn default() -> Self {
        Self::new(AgentRecoveryConfig::for_agent(AgentType::Supervisor))
    }
}

impl SupervisorRecoveryStrategy {
    pub fn new(config: AgentRecoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentRecoveryStrategy for SupervisorRecoveryStrategy {
    fn agent_type(&self) -> AgentType {
        AgentType::Supervisor
    }

    fn config(&self) -> &AgentRecoveryConfig {
        &self.config
    }

    fn assess_failure(&self, context: &RecoveryContext) -> FailureAssessment {
        let mut assessment = FailureAssessment::new("coordination_failure");
        assessment.cascade_impact = true;
        if let Some(agent) = metadata_string(context, "failed_agent") {
            assessment = assessment.with_detail("failed_agent", agent);
        }
        assessment
    }

    async fn execute_primary_recovery(
        &self,
        _context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value> {
        let failed_agent = assessment.details.get("failed_agent")?;
        Some(json!({
            "recovery_method": "agent_isolation",
            "excluded_agents": [failed_agent],
        }))
    }

    async fn execute_fallback_recovery(
        &self,
        _context: &RecoveryContext,
        _assessment: &FailureAssessment,
    ) -> Option<Value> {
        Some(json!({
            "recovery_method": "sequential_execution",
            "parallel": false,
        }))
    }

    async fn execute_degraded_mode(
        &self,
        _context: &RecoveryContext,
        _assessment: &FailureAssessment,
    ) -> Option<Value> {
        Some(json!({
            "recovery_method": "single_agent_mode",
            "agent": AgentType::Triage.as_str(),
            "degraded": true,
            "requires_manual_review": true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::SupervisorRecoveryStrategy;
    use crate::agents::strategy::{run_escalation, AgentRecoveryStrategy, RecoveryRung};
    use crate::domain::context::{OperationType, RecoveryContext};
    use crate::errors::Fault;

    #[tokio::test]
    async fn any_failure_is_a_cascading_coordination_failure() {
        let strategy = SupervisorRecoveryStrategy::default();
        let context = RecoveryContext::new(OperationType::AgentExecution, Fault::runtime("oops"));

        let assessment = strategy.assess_failure(&context);
        assert_eq!(assessment.failure_type, "coordination_failure");
        assert!(assessment.cascade_impact);

        let result = run_escalation(&strategy, &context).await.expect("recovered");
        assert_eq!(result.rung, RecoveryRung::Fallback);
    }

    #[tokio::test]
    async fn known_failed_agent_is_isolated() {
        let strategy = SupervisorRecoveryStrategy::default();
        let context = RecoveryContext::new(OperationType::AgentExecution, Fault::runtime("oops"))
            .with_metadata("failed_agent", "data_analysis");

        let result = run_escalation(&strategy, &context).await.expect("recovered");

        assert_eq!(result.rung, RecoveryRung::Primary);
        assert_eq!(result.payload["excluded_agents"][0], "data_analysis");
    }
}
