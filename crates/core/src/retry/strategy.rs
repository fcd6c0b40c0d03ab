use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::domain::context::{OperationType, RecoveryContext, Severity};
use crate::errors::FaultKind;
use crate::retry::backoff::RetryConfig;
use crate::retry::memory::{MeminfoProbe, MemoryProbe};

const TRANSIENT_DATABASE_TERMS: &[&str] =
    &["connection", "timeout", "timed out", "network", "deadlock", "lock timeout", "busy"];
const PERMANENT_DATABASE_TERMS: &[&str] = &["constraint", "unique", "foreign key"];
const TRANSIENT_API_TERMS: &[&str] = &["timeout", "timed out", "connection"];
const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];
const PATTERN_TERMS: &[&str] = &["connection", "timeout", "memory", "permission", "not found"];

pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.8;

/// Decides whether a failed attempt may be retried and how long to wait.
pub trait RetryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> &RetryConfig;

    fn should_retry(&self, context: &RecoveryContext) -> bool;

    fn get_retry_delay(&self, retry_count: u32) -> Duration {
        self.config().delay_for(retry_count)
    }

    /// Feedback hook called by the retry driver after every attempt.
    fn record_outcome(&self, _context: &RecoveryContext, _success: bool) {}
}

/// `"{kind}:{matched terms joined by ':'}"`, the key adaptive learning groups by.
pub fn error_pattern_key(context: &RecoveryContext) -> String {
    let terms = context.fault.matched_terms(PATTERN_TERMS);
    format!("{}:{}", context.fault.kind.as_str(), terms.join(":"))
}

fn exhausted(context: &RecoveryContext, ceiling: u32) -> bool {
    context.retry_count >= context.max_retries.min(ceiling)
}

fn status_code(context: &RecoveryContext) -> Option<u16> {
    context.fault.status_code.or_else(|| {
        context
            .metadata
            .get("status_code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
    })
}

/// Retries only what is generally safe: never past the ceiling, never on
/// critical failures.
#[derive(Clone, Debug, Default)]
pub struct DefaultRetryStrategy {
    config: RetryConfig,
}

impl DefaultRetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryStrategy for DefaultRetryStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn should_retry(&self, context: &RecoveryContext) -> bool {
        !exhausted(context, self.config.max_retries) && context.severity != Severity::Critical
    }
}

#[derive(Clone, Debug, Default)]
pub struct DatabaseRetryStrategy {
    config: RetryConfig,
}

impl DatabaseRetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryStrategy for DatabaseRetryStrategy {
    fn name(&self) -> &'static str {
        "database"
    }

    fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn should_retry(&self, context: &RecoveryContext) -> bool {
        if exhausted(context, self.config.max_retries) || context.severity == Severity::Critical {
            return false;
        }

        let fault = &context.fault;
        if fault.kind == FaultKind::Constraint || fault.mentions_any(PERMANENT_DATABASE_TERMS) {
            return false;
        }

        matches!(fault.kind, FaultKind::Timeout | FaultKind::Connection)
            || fault.mentions_any(TRANSIENT_DATABASE_TERMS)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ApiRetryStrategy {
    config: RetryConfig,
}

impl ApiRetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryStrategy for ApiRetryStrategy {
    fn name(&self) -> &'static str {
        "api"
    }

    fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn should_retry(&self, context: &RecoveryContext) -> bool {
        if exhausted(context, self.config.max_retries) {
            return false;
        }

        if let Some(status) = status_code(context) {
            if RETRYABLE_STATUS_CODES.contains(&status) {
                return true;
            }
            if (400..500).contains(&status) {
                return false;
            }
        }

        matches!(context.fault.kind, FaultKind::Timeout | FaultKind::Connection)
            || context.fault.mentions_any(TRANSIENT_API_TERMS)
    }
}

pub struct MemoryAwareRetryStrategy {
    config: RetryConfig,
    threshold: f64,
    probe: Arc<dyn MemoryProbe>,
}

impl MemoryAwareRetryStrategy {
    pub fn new(config: RetryConfig, threshold: f64, probe: Arc<dyn MemoryProbe>) -> Self {
        Self { config, threshold, probe }
    }

    pub fn with_system_probe(config: RetryConfig, threshold: f64) -> Self {
        Self::new(config, threshold, Arc::new(MeminfoProbe::default()))
    }
}

impl RetryStrategy for MemoryAwareRetryStrategy {
    fn name(&self) -> &'static str {
        "memory_aware"
    }

    fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn should_retry(&self, context: &RecoveryContext) -> bool {
        if exhausted(context, self.config.max_retries) {
            return false;
        }

        if let Some(usage) = self.probe.usage_ratio() {
            if usage > self.threshold {
                tracing::warn!(
                    event_name = "recovery.retry.memory_pressure",
                    operation_id = %context.operation_id,
                    memory_usage = usage,
                    threshold = self.threshold,
                    "retry blocked by memory pressure"
                );
                return false;
            }
        }

        !(context.fault.kind == FaultKind::Memory || context.fault.mentions("memory"))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatternStats {
    pub successes: u32,
    pub failures: u32,
}

impl PatternStats {
    pub fn failure_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        (total > 0).then(|| f64::from(self.failures) / f64::from(total))
    }
}

/// Learns per-pattern failure rates and tunes the retry ceiling from them.
///
/// Above 80% failures the ceiling shrinks to at most 2; below 30% it grows by
/// one, capped at 5. Eligibility itself only blocks on critical severity.
#[derive(Debug, Default)]
pub struct AdaptiveRetryStrategy {
    config: RetryConfig,
    patterns: Mutex<HashMap<String, PatternStats>>,
}

impl AdaptiveRetryStrategy {
    pub const MAX_CEILING: u32 = 5;
    pub const SHRUNK_CEILING: u32 = 2;

    pub fn new(config: RetryConfig) -> Self {
        Self { config, patterns: Mutex::new(HashMap::new()) }
    }

    pub fn stats_for(&self, pattern: &str) -> PatternStats {
        match self.patterns.lock() {
            Ok(patterns) => patterns.get(pattern).copied().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().get(pattern).copied().unwrap_or_default(),
        }
    }

    pub fn failure_rate(&self, pattern: &str) -> Option<f64> {
        self.stats_for(pattern).failure_rate()
    }

    pub fn effective_max_retries(&self, pattern: &str) -> u32 {
        let base = self.config.max_retries;
        match self.failure_rate(pattern) {
            Some(rate) if rate > 0.8 => base.min(Self::SHRUNK_CEILING),
            Some(rate) if rate < 0.3 => (base + 1).min(Self::MAX_CEILING),
            _ => base,
        }
    }
}

impl RetryStrategy for AdaptiveRetryStrategy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn should_retry(&self, context: &RecoveryContext) -> bool {
        if context.severity == Severity::Critical {
            return false;
        }
        let ceiling = self.effective_max_retries(&error_pattern_key(context));
        context.retry_count < ceiling
    }

    fn record_outcome(&self, context: &RecoveryContext, success: bool) {
        let key = error_pattern_key(context);
        let mut patterns = match self.patterns.lock() {
            Ok(patterns) => patterns,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stats = patterns.entry(key).or_default();
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
    }
}

/// Strategy per operation type, built once from a shared delay schedule.
pub struct RetryPolicies {
    database: Arc<dyn RetryStrategy>,
    api: Arc<dyn RetryStrategy>,
    memory_aware: Arc<dyn RetryStrategy>,
    adaptive: Arc<dyn RetryStrategy>,
}

impl RetryPolicies {
    pub fn new(config: RetryConfig, memory_threshold: f64, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            database: Arc::new(DatabaseRetryStrategy::new(config.clone())),
            api: Arc::new(ApiRetryStrategy::new(config.clone())),
            memory_aware: Arc::new(MemoryAwareRetryStrategy::new(
                config.clone(),
                memory_threshold,
                probe,
            )),
            adaptive: Arc::new(AdaptiveRetryStrategy::new(config)),
        }
    }

    pub fn for_operation(&self, operation_type: OperationType) -> Arc<dyn RetryStrategy> {
        match operation_type {
            OperationType::DatabaseRead | OperationType::DatabaseWrite => self.database.clone(),
            OperationType::ExternalApi
            | OperationType::LlmRequest
            | OperationType::WebsocketSend => self.api.clone(),
            OperationType::AgentExecution => self.memory_aware.clone(),
            OperationType::FileOperation | OperationType::CacheOperation => self.adaptive.clone(),
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::new(
            RetryConfig::default(),
            DEFAULT_MEMORY_THRESHOLD,
            Arc::new(MeminfoProbe::default()),
        )
    }
}
