pub mod agents;
pub mod audit;
pub mod circuit_breaker;
pub mod compensation;
pub mod config;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod facade;
pub mod metrics;
pub mod retry;
pub mod rollback;
pub mod saga;
pub mod transaction;

pub use agents::{AgentRecoveryRegistry, AgentRecoveryStrategy, AgentType, EscalationResult};
pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use compensation::{CompensationExecutor, CompensationHandler, CompensationRegistry};
pub use config::{AppConfig, ConfigError, LoadOptions, RecoveryConfig};
pub use domain::{
    Operation, OperationId, OperationState, OperationType, RecoveryContext, Severity, Transaction,
    TransactionId, TransactionState,
};
pub use errors::{Fault, FaultKind, InterfaceError, RecoveryError};
pub use executor::{RecoveryAction, RecoveryExecutor, RecoveryResult};
pub use facade::{RecoveryManagerBuilder, UnifiedRecoveryManager};
pub use metrics::{RecoveryMetrics, RecoveryReport};
pub use retry::{retry_with_strategy, RetryConfig, RetryPolicies, RetryStrategy};
pub use rollback::{
    RollbackData, RollbackExecutor, RollbackManager, RollbackOutcome, SessionId, StoreKind,
    WriteKind,
};
pub use saga::{saga_action, SagaId, SagaOrchestrator, SagaOutcome, SagaState, SagaStep};
pub use transaction::{TransactionManager, TransactionParticipant};
