use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::strategy::{metadata_string, AgentRecoveryStrategy};
use crate::agents::{AgentRecoveryConfig, AgentType, FailureAssessment};
use crate::domain::context::RecoveryContext;

const KEYWORD_INTENTS: &[(&str, &str, &str)] = &[
    ("cost", "cost_optimization", "cost_analyzer"),
    ("spend", "cost_optimization", "cost_analyzer"),
    ("latency", "performance_optimization", "performance_profiler"),
    ("performance", "performance_optimization", "performance_profiler"),
    ("throughput", "performance_optimization", "performance_profiler"),
    ("report", "reporting", "report_generator"),
];

/// Recovery for the request-triage agent: fall back to a generic intent
/// rather than blocking the request.
pub struct TriageRecoveryStrategy {
    config: AgentRecoveryConfig,
}

impl Default for TriageRecoveryStrategy {
    fn default() -> Self {
        Self::new(AgentRecoveryConfig::for_agent(AgentType::Triage))
    }
}

impl TriageRecoveryStrategy {
    pub fn new(config: AgentRecoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentRecoveryStrategy for TriageRecoveryStrategy {
    fn agent_type(&self) -> AgentType {
        AgentType::Triage
    }

    fn config(&self) -> &AgentRecoveryConfig {
        &self.config
    }

    fn assess_failure(&self, context: &RecoveryContext) -> FailureAssessment {
        let fault = &context.fault;
        let failure_type = if fault.mentions("intent") {
            "intent_detection"
        } else if fault.mentions("entity") {
            "entity_extraction"
        } else if fault.mentions("tool") {
            "tool_recommendation"
        } else if fault.mentions_any(&["timeout", "timed out"]) {
            "timeout"
        } else {
            "unknown"
        };
        FailureAssessment::new(failure_type)
    }

    async fn execute_primary_recovery(
        &self,
        context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value> {
        match assessment.failure_type.as_str() {
            "intent_detection" | "timeout" => Some(json!({
                "intent": "general_inquiry",
                "tools": ["general_assistant"],
                "confidence": 0.7,
                "recovery_method": "simplified_triage",
            })),
            "entity_extraction" => Some(json!({
                "intent": metadata_string(context, "intent")
                    .unwrap_or_else(|| "general_inquiry".to_owned()),
                "entities": {},
                "tools": ["general_assistant"],
                "confidence": 0.5,
                "recovery_method": "entities_skipped",
            })),
            "tool_recommendation" => Some(json!({
                "intent": metadata_string(context, "intent")
                    .unwrap_or_else(|| "general_inquiry".to_owned()),
                "tools": ["general_assistant"],
                "confidence": 0.6,
                "recovery_method": "default_tools",
            })),
            _ => None,
        }
    }

    async fn execute_fallback_recovery(
        &self,
        context: &RecoveryContext,
        _assessment: &FailureAssessment,
    ) -> Option<Value> {
        let request = metadata_string(context, "user_request")?.to_ascii_lowercase();
        KEYWORD_INTENTS.iter().find(|(keyword, _, _)| request.contains(keyword)).map(
            |(_, intent, tool)| {
                json!({
                    "intent": intent,
                    "tools": [tool],
                    "confidence": 0.5,
                    "recovery_method": "keyword_triage",
                })
            },
        )
    }

    async fn execute_degraded_mode(
        &self,
        _context: &RecoveryContext,
        _assessment: &FailureAssessment,
    ) -> Option<Value> {
        Some(json!({
            "intent": "general_inquiry",
            "tools": [],
            "confidence": 0.3,
            "degraded": true,
            "requires_manual_review": true,
            "recovery_method": "degraded_triage",
        }))
    }
}
