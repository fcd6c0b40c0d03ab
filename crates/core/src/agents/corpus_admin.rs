use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::strategy::metadata_string;
use crate::agents::{AgentRecoveryConfig, AgentRecoveryStrategy, AgentType, FailureAssessment};
use crate::domain::context::RecoveryContext;

const UPLOAD_CHUNK_BYTES: u64 = 1024 * 1024;

/// Recovery for corpus/document administration. Index and storage failures
/// put corpus integrity at risk: no degraded mode, manual follow-up.
pub struct CorpusAdminRecoveryStrategy {
    config: AgentRecoveryConfig,
}

impl Default for CorpusAdminRecoveryStrategy {
    fn default() -> Self {
        Self::new(AgentRecoveryConfig::for_agent(AgentType::CorpusAdmin))
    }
}

impl CorpusAdminRecoveryStrategy {
    pub fn new(config: AgentRecoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentRecoveryStrategy for CorpusAdminRecoveryStrategy {
    fn agent_type(&self) -> AgentType {
        AgentType::CorpusAdmin
    }

    fn config(&self) -> &AgentRecoveryConfig {
        &self.config
    }

    fn assess_failure(&self, context: &RecoveryContext) -> FailureAssessment {
        let fault = &context.fault;
        if fault.mentions("upload") {
            FailureAssessment::new("file_upload")
        } else if fault.mentions_any(&["validation", "invalid", "schema"]) {
            let mut assessment = FailureAssessment::new("document_validation");
            assessment.degraded_safe = true;
            assessment
        } else if fault.mentions("index") {
            integrity_risk("indexing_failure")
        } else if fault.mentions_any(&["storage", "disk", "write"]) {
            integrity_risk("storage_failure")
        } else {
            FailureAssessment::new("unknown").with_rungs(true, true, false)
        }
    }

    async fn execute_primary_recovery(
        &self,
        context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value> {
        match assessment.failure_type.as_str() {
            "file_upload" => Some(json!({
                "recovery_method": "chunked_upload",
                "chunk_size_bytes": UPLOAD_CHUNK_BYTES,
            })),
            "document_validation" => Some(json!({
                "recovery_method": "lenient_validation",
                "strict": false,
            })),
            "indexing_failure" => metadata_string(context, "document_id").map(|document_id| {
                json!({
                    "recovery_method": "reindex_document",
                    "document_id": document_id,
                })
            }),
            "storage_failure" => metadata_string(context, "alternate_storage").map(|location| {
                json!({
                    "recovery_method": "alternate_storage",
                    "location": location,
                })
            }),
            _ => None,
        }
    }

    async fn execute_fallback_recovery(
        &self,
        context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value> {
        match assessment.failure_type.as_str() {
            "file_upload" | "document_validation" | "indexing_failure" => Some(json!({
                "recovery_method": "queued_for_retry",
                "queued": true,
                "failure_type": assessment.failure_type,
            })),
            "storage_failure" => metadata_string(context, "staging_area").map(|staging| {
                json!({
                    "recovery_method": "staged_write",
                    "staging_area": staging,
                })
            }),
            _ => None,
        }
    }

    async fn execute_degraded_mode(
        &self,
        _context: &RecoveryContext,
        assessment: &FailureAssessment,
    ) -> Option<Value> {
        Some(json!({
            "recovery_method": "unvalidated_ingest",
            "degraded": true,
            "requires_manual_review": true,
            "failure_type": assessment.failure_type,
        }))
    }
}

fn integrity_risk(failure_type: &str) -> FailureAssessment {
    let mut assessment = FailureAssessment::new(failure_type).with_rungs(true, true, false);
    assessment.data_integrity_risk = true;
    assessment
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::CorpusAdminRecoveryStrategy;
    use crate::agents::strategy::{run_escalation, AgentRecoveryStrategy, RecoveryRung};
    use crate::agents::{AgentRecoveryConfig, AgentType, FailureAssessment};
    use crate::domain::context::{OperationType, RecoveryContext};
    use crate::errors::{Fault, RecoveryError};

    fn context(message: &str) -> RecoveryContext {
        RecoveryContext::new(OperationType::AgentExecution, Fault::runtime(message))
    }

    /// Corpus strategy whose recovery rungs always come back empty.
    struct Unrecoverable(CorpusAdminRecoveryStrategy);

    #[async_trait]
    impl AgentRecoveryStrategy for Unrecoverable {
        fn agent_type(&self) -> AgentType {
            self.0.agent_type()
        }

        fn config(&self) -> &AgentRecoveryConfig {
            self.0.config()
        }

        fn assess_failure(&self, context: &RecoveryContext) -> FailureAssessment {
            self.0.assess_failure(context)
        }

        async fn execute_primary_recovery(
            &self,
            _context: &RecoveryContext,
            _assessment: &FailureAssessment,
        ) -> Option<Value> {
            None
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
            context: &RecoveryContext,
            assessment: &FailureAssessment,
        ) -> Option<Value> {
            self.0.execute_degraded_mode(context, assessment).await
        }
    }

    #[tokio::test]
    async fn storage_failure_without_recovery_raises() {
        let strategy = Arc::new(Unrecoverable(CorpusAdminRecoveryStrategy::default()));
        let context = context("storage write failed");

        let assessment = strategy.assess_failure(&context);
        assert!(assessment.data_integrity_risk);
        assert!(!assessment.try_degraded_mode);

        let result = run_escalation(strategy.as_ref(), &context).await;

        assert!(matches!(
            result,
            Err(RecoveryError::AgentRecoveryFailed { agent_type: AgentType::CorpusAdmin, .. })
        ));
    }

    #[tokio::test]
    async fn storage_failure_uses_staging_area_when_available() {
        let strategy = CorpusAdminRecoveryStrategy::default();
        let context = context("storage write failed").with_metadata("staging_area", "s3://staging");

        let result = run_escalation(&strategy, &context).await.expect("recovered");

        assert_eq!(result.rung, RecoveryRung::Fallback);
        assert_eq!(result.payload["staging_area"], "s3://staging");
    }

    #[tokio::test]
    async fn document_validation_may_degrade_despite_config() {
        let strategy = Unrecoverable(CorpusAdminRecoveryStrategy::default());
        let context = context("document validation failed: missing title");

        let result = run_escalation(&strategy, &context).await.expect("degraded");

        assert_eq!(result.rung, RecoveryRung::Degraded);
        assert_eq!(result.payload["requires_manual_review"], true);
    }

    #[tokio::test]
    async fn indexing_failure_is_an_integrity_risk() {
        let strategy = CorpusAdminRecoveryStrategy::default();
        let assessment = strategy.assess_failure(&context("vector index rebuild crashed"));

        assert_eq!(assessment.failure_type, "indexing_failure");
        assert!(assessment.data_integrity_risk);
    }
}
