use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{AgentRecoveryConfig, AgentRecoveryStrategy, AgentType, FailureAssessment};
use crate::domain::context::RecoveryContext;
use crate::errors::FaultKind;

const DEFAULT_TIME_RANGE_HOURS: u64 = 168;
const MIN_TIME_RANGE_HOURS: u64 = 1;
const FALLBACK_SAMPLE_RATE: f64 = 0.1;

/// Recovery for the workload data-analysis agent: narrow the query, serve
/// cached results, or sample.
pub struct DataAnalysisRecoveryStrategy {
    config: AgentRecoveryConfig,
}

impl Default for DataAnalysisRecoveryStrategy {
    fn default() -> Self {
        Self::new(AgentRecoveryConfig::for_agent(AgentType::DataAnalysis))
    }
}

impl DataAnalysisRecoveryStrategy {
    pub fn new(config: AgentRecoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentRecoveryStrategy for DataAnalysisRecoveryStrategy {
    fn agent_type(&self) -> AgentType {
        AgentType::DataAnalysis
    }

    fn config(&self) -> &AgentRecoveryConfig {
        &self.config
    }

    fn assess_failure(&self, context: &RecoveryContext) -> FailureAssessment {
        let fault = &context.fault;
        if fault.kind == FaultKind::Timeout || fault.mentions_any(&["timeout", "timed out"]) {
            FailureAssessment::new("query_timeout")
        } else if fault.kind == FaultKind::Memory
            || fault.mentions_any(&["memory", "resource", "quota"])
        {
            // Re-running the same query under pressure only makes it worse.
            FailureAssessment::new("resource_exhaustion").with_rungs(false, true, true)
        } else if fault.kind == FaultKind::Connection
            || fault.mentions_any(&["database", "connection", "clickhouse", "postgres"])
        {
            FailureAssessment::new("database_failure")
        } else if fault.kind == FaultKind::Validation
            || fault.mentions_any(&["invalid", "null", "malformed", "schema"])
        {
            FailureAssessment::new("data_quality")
        } else {
            FailureAssessment::new("unknown").with_rungs(false, true, true)
        }
    }

    async fn execute_primary_recovery(
        &self,
        context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value> {
        match assessment.failure_type.as_str() {
            "query_timeout" => {
                let requested = context
                    .metadata
                    .get("time_range_hours")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_TIME_RANGE_HOURS);
                let reduced = (requested / 4).max(MIN_TIME_RANGE_HOURS);
                (reduced < requested).then(|| {
                    json!({
                        "recovery_method": "reduced_time_range",
                        "time_range_hours": reduced,
                        "original_time_range_hours": requested,
                    })
                })
            }
            "database_failure" => context.metadata.get("cached_result").cloned().map(|cached| {
                json!({
                    "recovery_method": "cached_results",
                    "data": cached,
                    "stale": true,
                })
            }),
            "data_quality" => Some(json!({
                "recovery_method": "filtered_invalid_rows",
                "strict_validation": false,
            })),
            _ => None,
        }
    }

    async fn execute_fallback_recovery(
        &self,
        _context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value> {
        Some(json!({
            "recovery_method": "sampled_analysis",
            "sample_rate": FALLBACK_SAMPLE_RATE,
            "failure_type": assessment.failure_type,
        }))
    }

    async fn execute_degraded_mode(
        &self,
        _context: &RecoveryContext,
        _assessment: &FailureAssessment,
    ) -> Option<Value> {
        Some(json!({
            "recovery_method": "summary_statistics_only",
            "degraded": true,
            "requires_manual_review": true,
        }))
    }
}
