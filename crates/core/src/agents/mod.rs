pub mod corpus_admin;
pub mod data_analysis;
pub mod registry;
pub mod strategy;
pub mod supervisor;
pub mod triage;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RecoveryError;

pub use corpus_admin::CorpusAdminRecoveryStrategy;
pub use data_analysis::DataAnalysisRecoveryStrategy;
pub use registry::AgentRecoveryRegistry;
pub use strategy::{run_escalation, AgentRecoveryStrategy, EscalationResult, RecoveryRung};
pub use supervisor::SupervisorRecoveryStrategy;
pub use triage::TriageRecoveryStrategy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Triage,
    DataAnalysis,
    CorpusAdmin,
    Supervisor,
}

impl AgentType {
    pub const ALL: [AgentType; 4] =
        [Self::Triage, Self::DataAnalysis, Self::CorpusAdmin, Self::Supervisor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::DataAnalysis => "data_analysis",
            Self::CorpusAdmin => "corpus_admin",
            Self::Supervisor => "supervisor",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = RecoveryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "triage" | "triage_agent" => Ok(Self::Triage),
            "data_analysis" | "data" | "data_agent" => Ok(Self::DataAnalysis),
            "corpus_admin" | "corpus" | "corpus_admin_agent" => Ok(Self::CorpusAdmin),
            "supervisor" | "supervisor_agent" => Ok(Self::Supervisor),
            _ => Err(RecoveryError::UnknownAgentType(value.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Per-agent recovery policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRecoveryConfig {
    pub max_retries: u32,
    pub retry_delay_base: Duration,
    pub circuit_breaker_threshold: u32,
    pub fallback_enabled: bool,
    pub compensation_enabled: bool,
    pub priority: Priority,
    pub timeout_seconds: u64,
    pub preserve_state: bool,
    pub allow_degraded_mode: bool,
    pub require_manual_intervention: bool,
}

impl AgentRecoveryConfig {
    pub fn for_agent(agent_type: AgentType) -> Self {
        match agent_type {
            AgentType::Triage => Self {
                max_retries: 3,
                retry_delay_base: Duration::from_secs(1),
                circuit_breaker_threshold: 5,
                fallback_enabled: true,
                compensation_enabled: false,
                priority: Priority::High,
                timeout_seconds: 30,
                preserve_state: false,
                allow_degraded_mode: true,
                require_manual_intervention: false,
            },
            AgentType::DataAnalysis => Self {
                max_retries: 2,
                retry_delay_base: Duration::from_secs(2),
                circuit_breaker_threshold: 3,
                fallback_enabled: true,
                compensation_enabled: true,
                priority: Priority::Medium,
                timeout_seconds: 120,
                preserve_state: true,
                allow_degraded_mode: true,
                require_manual_intervention: false,
            },
            AgentType::CorpusAdmin => Self {
                max_retries: 2,
                retry_delay_base: Duration::from_secs(2),
                circuit_breaker_threshold: 3,
                fallback_enabled: true,
                compensation_enabled: true,
                priority: Priority::High,
                timeout_seconds: 60,
                preserve_state: true,
                allow_degraded_mode: false,
                require_manual_intervention: true,
            },
            AgentType::Supervisor => Self {
                max_retries: 3,
                retry_delay_base: Duration::from_secs(1),
                circuit_breaker_threshold: 5,
                fallback_enabled: true,
                compensation_enabled: true,
                priority: Priority::Critical,
                timeout_seconds: 300,
                preserve_state: true,
                allow_degraded_mode: true,
                require_manual_intervention: true,
            },
        }
    }
}

/// Agent-specific classification of a failure and which rungs to try.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureAssessment {
    pub failure_type: String,
    pub try_primary_recovery: bool,
    pub try_fallback_recovery: bool,
    pub try_degraded_mode: bool,
    pub data_integrity_risk: bool,
    pub cascade_impact: bool,
    /// Degraded mode is safe for this failure even when the agent's config
    /// disallows it.
    pub degraded_safe: bool,
    pub details: BTreeMap<String, Value>,
}

impl FailureAssessment {
    pub fn new(failure_type: impl Into<String>) -> Self {
        Self {
            failure_type: failure_type.into(),
            try_primary_recovery: true,
            try_fallback_recovery: true,
            try_degraded_mode: true,
            data_integrity_risk: false,
            cascade_impact: false,
            degraded_safe: false,
            details: BTreeMap::new(),
        }
    }

    pub fn with_rungs(mut self, primary: bool, fallback: bool, degraded: bool) -> Self {
        self.try_primary_recovery = primary;
        self.try_fallback_recovery = fallback;
        self.try_degraded_mode = degraded;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{AgentRecoveryConfig, AgentType, Priority};
    use crate::errors::RecoveryError;

    #[test]
    fn agent_type_parses_known_names_and_rejects_others() {
        assert_eq!("Triage".parse::<AgentType>().ok(), Some(AgentType::Triage));
        assert_eq!("data-analysis".parse::<AgentType>().ok(), Some(AgentType::DataAnalysis));
        assert_eq!("corpus_admin".parse::<AgentType>().ok(), Some(AgentType::CorpusAdmin));
        assert!(matches!(
            "reporting".parse::<AgentType>(),
            Err(RecoveryError::UnknownAgentType(name)) if name == "reporting"
        ));
    }

    #[test]
    fn corpus_admin_defaults_favour_integrity() {
        let config = AgentRecoveryConfig::for_agent(AgentType::CorpusAdmin);
        assert!(!config.allow_degraded_mode);
        assert!(config.require_manual_intervention);

        let supervisor = AgentRecoveryConfig::for_agent(AgentType::Supervisor);
        assert_eq!(supervisor.priority, Priority::Critical);
    }
}
