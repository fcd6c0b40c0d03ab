use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::agents::strategy::{
    run_escalation, AgentRecoveryStrategy, EscalationResult, RecoveryRung,
};
use crate::agents::{
    AgentType, CorpusAdminRecoveryStrategy, DataAnalysisRecoveryStrategy,
    SupervisorRecoveryStrategy, TriageRecoveryStrategy,
};
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use crate::domain::context::RecoveryContext;
use crate::errors::RecoveryError;

/// Strategy per agent type. Strategies can be swapped at runtime with
/// [`AgentRecoveryRegistry::register`].
pub struct AgentRecoveryRegistry {
    strategies: RwLock<HashMap<AgentType, Arc<dyn AgentRecoveryStrategy>>>,
    audit: Arc<dyn AuditSink>,
}

impl Default for AgentRecoveryRegistry {
    fn default() -> Self {
        Self::with_defaults(Arc::new(TracingAuditSink))
    }
}

impl AgentRecoveryRegistry {
    pub fn empty(audit: Arc<dyn AuditSink>) -> Self {
        Self { strategies: RwLock::new(HashMap::new()), audit }
    }

    pub fn with_defaults(audit: Arc<dyn AuditSink>) -> Self {
        let registry = Self::empty(audit);
        registry.register(Arc::new(TriageRecoveryStrategy::default()));
        registry.register(Arc::new(DataAnalysisRecoveryStrategy::default()));
        registry.register(Arc::new(CorpusAdminRecoveryStrategy::default()));
        registry.register(Arc::new(SupervisorRecoveryStrategy::default()));
        registry
    }

    /// Registers `strategy` under its own agent type, replacing any previous one.
    pub fn register(&self, strategy: Arc<dyn AgentRecoveryStrategy>) {
        let mut strategies = match self.strategies.write() {
            Ok(strategies) => strategies,
            Err(poisoned) => poisoned.into_inner(),
        };
        strategies.insert(strategy.agent_type(), strategy);
    }

    pub fn get(&self, agent_type: AgentType) -> Option<Arc<dyn AgentRecoveryStrategy>> {
        let strategies = match self.strategies.read() {
            Ok(strategies) => strategies,
            Err(poisoned) => poisoned.into_inner(),
        };
        strategies.get(&agent_type).cloned()
    }

    /// Agent types with a registered strategy, in declaration order.
    pub fn registered_types(&self) -> Vec<AgentType> {
        let strategies = match self.strategies.read() {
            Ok(strategies) => strategies,
            Err(poisoned) => poisoned.into_inner(),
        };
        AgentType::ALL.into_iter().filter(|agent_type| strategies.contains_key(agent_type)).collect()
    }

    pub async fn recover(
        &self,
        agent_type: AgentType,
        context: &RecoveryContext,
    ) -> Result<EscalationResult, RecoveryError> {
        let strategy = self
            .get(agent_type)
            .ok_or_else(|| RecoveryError::UnknownAgentType(agent_type.as_str().to_owned()))?;

        let result = run_escalation(strategy.as_ref(), context).await;
        let event = match &result {
            Ok(recovered) => AuditEvent::for_attempt(
                context,
                "recovery.agent.recovered",
                AuditCategory::AgentRecovery,
                agent_type.as_str(),
                if recovered.rung == RecoveryRung::Degraded {
                    AuditOutcome::Degraded
                } else {
                    AuditOutcome::Recovered
                },
            )
            .with_metadata("rung", recovered.rung.as_str())
            .with_metadata("failure_type", recovered.assessment.failure_type.clone()),
            Err(error) => AuditEvent::for_attempt(
                context,
                "recovery.agent.exhausted",
                AuditCategory::AgentRecovery,
                agent_type.as_str(),
                AuditOutcome::Failed,
            )
            .with_metadata("error", error.to_string()),
        };
        self.audit.emit(event);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::AgentRecoveryRegistry;
    use crate::agents::{
        AgentRecoveryConfig, AgentRecoveryStrategy, AgentType, FailureAssessment, RecoveryRung,
    };
    use crate::audit::{AuditOutcome, InMemoryAuditSink};
    use crate::domain::context::{OperationType, RecoveryContext};
    use crate::errors::{Fault, RecoveryError};

    struct AlwaysCached(AgentRecoveryConfig);

    #[async_trait]
    impl AgentRecoveryStrategy for AlwaysCached {
        fn agent_type(&self) -> AgentType {
            AgentType::Triage
        }

        fn config(&self) -> &AgentRecoveryConfig {
            &self.0
        }

        fn assess_failure(&self, _context: &RecoveryContext) -> FailureAssessment {
            FailureAssessment::new("any")
        }

        async fn execute_primary_recovery(
            &self,
            _context: &RecoveryContext,
            _assessment: &FailureAssessment,
        ) -> Option<Value> {
            Some(json!({"recovery_method": "cached_triage"}))
        }

        async fn execute_fallback_recovery(
            &self,
            _context: &RecoveryContext,
            _assessment: &FailureAssessment,
        ) -> Option<Value> {
            None
        }

        async fn execute_degraded_mode(
            &self,
            _context: &RecoveryContext,
            _assessment: &FailureAssessment,
        ) -> Option<Value> {
            None
        }
    }

    fn context(message: &str) -> RecoveryContext {
        RecoveryContext::new(OperationType::AgentExecution, Fault::runtime(message))
    }

    #[tokio::test]
    async fn default_registry_covers_every_agent_type() {
        let registry = AgentRecoveryRegistry::default();
        for agent_type in AgentType::ALL {
            assert!(registry.get(agent_type).is_some(), "{agent_type}");
        }
        assert_eq!(registry.registered_types(), AgentType::ALL.to_vec());
    }

    #[tokio::test]
    async fn registering_replaces_the_strategy() {
        let sink = InMemoryAuditSink::default();
        let registry = AgentRecoveryRegistry::with_defaults(Arc::new(sink.clone()));
        registry.register(Arc::new(AlwaysCached(AgentRecoveryConfig::for_agent(AgentType::Triage))));

        let result =
            registry.recover(AgentType::Triage, &context("anything")).await.expect("recovered");

        assert_eq!(result.payload["recovery_method"], "cached_triage");
        assert_eq!(sink.events()[0].outcome, AuditOutcome::Recovered);
    }

    #[tokio::test]
    async fn audit_records_degraded_and_failed_attempts() {
        let sink = InMemoryAuditSink::default();
        let registry = AgentRecoveryRegistry::with_defaults(Arc::new(sink.clone()));

        let degraded = registry
            .recover(AgentType::Triage, &context("model returned garbage"))
            .await
            .expect("degraded");
        assert_eq!(degraded.rung, RecoveryRung::Degraded);

        let failed = registry.recover(AgentType::CorpusAdmin, &context("storage write failed")).await;
        assert!(matches!(failed, Err(RecoveryError::AgentRecoveryFailed { .. })));

        let outcomes: Vec<_> = sink.events().iter().map(|event| event.outcome).collect();
        assert_eq!(outcomes, vec![AuditOutcome::Degraded, AuditOutcome::Failed]);
    }

    #[tokio::test]
    async fn empty_registry_reports_unknown_agent() {
        let registry = AgentRecoveryRegistry::empty(Arc::new(InMemoryAuditSink::default()));

        assert!(registry.registered_types().is_empty());
        let result = registry.recover(AgentType::Supervisor, &context("boom")).await;

        assert!(matches!(result, Err(RecoveryError::UnknownAgentType(_))));
    }
}
