use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::agents::{
    AgentRecoveryRegistry, AgentRecoveryStrategy, AgentType, Priority, RecoveryRung,
};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::compensation::{CompensationExecutor, CompensationHandler, CompensationRegistry};
use crate::config::RecoveryConfig;
use crate::domain::context::{OperationType, RecoveryContext, Severity};
use crate::domain::operation::{TransactionId, TransactionState};
use crate::errors::{Fault, RecoveryError};
use crate::executor::{RecoveryExecutor, RecoveryResult};
use crate::metrics::{MetricsRecorder, RecoveryMetrics, RecoveryOrigin, RecoveryReport};
use crate::retry::{MeminfoProbe, MemoryProbe, RetryPolicies};
use crate::rollback::{RollbackData, RollbackExecutor, RollbackManager, WriteKind};
use crate::saga::{SagaOrchestrator, SagaOutcome, SagaStep};
use crate::transaction::{TransactionManager, TransactionParticipant};

/// Collects the injectable parts of a [`UnifiedRecoveryManager`].
pub struct RecoveryManagerBuilder {
    config: RecoveryConfig,
    audit: Arc<dyn AuditSink>,
    memory_probe: Arc<dyn MemoryProbe>,
    rollback_executors: Vec<Arc<dyn RollbackExecutor>>,
    participants: Vec<Arc<dyn TransactionParticipant>>,
    compensation_handlers: Vec<(OperationType, Arc<dyn CompensationHandler>)>,
    agent_strategies: Vec<Arc<dyn AgentRecoveryStrategy>>,
}

impl RecoveryManagerBuilder {
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn with_rollback_executor(mut self, executor: Arc<dyn RollbackExecutor>) -> Self {
        self.rollback_executors.push(executor);
        self
    }

    pub fn with_participant(mut self, participant: Arc<dyn TransactionParticipant>) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_compensation_handler(
        mut self,
        operation_type: OperationType,
        handler: Arc<dyn CompensationHandler>,
    ) -> Self {
        self.compensation_handlers.push((operation_type, handler));
        self
    }

    /// Replaces the default strategy for the strategy's agent type.
    pub fn with_agent_strategy(mut self, strategy: Arc<dyn AgentRecoveryStrategy>) -> Self {
        self.agent_strategies.push(strategy);
        self
    }

    pub fn build(self) -> UnifiedRecoveryManager {
        let config = self.config;

        let registry = Arc::new(CompensationRegistry::with_defaults());
        for (operation_type, handler) in self.compensation_handlers {
            registry.register(operation_type, handler);
        }
        let compensation = Arc::new(
            CompensationExecutor::new(registry).with_concurrency(config.compensation_concurrency),
        );

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_config()));
        let executor = RecoveryExecutor::new(
            RetryPolicies::new(config.retry_config(), config.memory_threshold, self.memory_probe),
            breakers,
            compensation.clone(),
            self.audit.clone(),
        );

        let agents = AgentRecoveryRegistry::with_defaults(self.audit);
        for strategy in self.agent_strategies {
            agents.register(strategy);
        }

        let rollbacks = self
            .rollback_executors
            .into_iter()
            .fold(RollbackManager::new(config.rollback_session_timeout()), |manager, executor| {
                manager.with_executor(executor)
            });

        let transactions = self
            .participants
            .into_iter()
            .fold(TransactionManager::new(compensation), |manager, participant| {
                manager.with_participant(participant)
            });

        let sagas = SagaOrchestrator::new(config.saga_timeout(), config.saga_history_limit);

        UnifiedRecoveryManager {
            executor,
            agents,
            rollbacks,
            transactions,
            sagas,
            metrics: MetricsRecorder::default(),
        }
    }
}

/// Single entry point routing a failure by origin to the matching
/// recovery mechanism.
pub struct UnifiedRecoveryManager {
    executor: RecoveryExecutor,
    agents: AgentRecoveryRegistry,
    rollbacks: RollbackManager,
    transactions: TransactionManager,
    sagas: SagaOrchestrator,
    metrics: MetricsRecorder,
}

impl Default for UnifiedRecoveryManager {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

impl UnifiedRecoveryManager {
    pub fn builder(config: RecoveryConfig) -> RecoveryManagerBuilder {
        RecoveryManagerBuilder {
            config,
            audit: Arc::new(TracingAuditSink),
            memory_probe: Arc::new(MeminfoProbe::default()),
            rollback_executors: Vec::new(),
            participants: Vec::new(),
            compensation_handlers: Vec::new(),
            agent_strategies: Vec::new(),
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::builder(config.clone()).build()
    }

    pub fn executor(&self) -> &RecoveryExecutor {
        &self.executor
    }

    pub fn agents(&self) -> &AgentRecoveryRegistry {
        &self.agents
    }

    pub fn rollbacks(&self) -> &RollbackManager {
        &self.rollbacks
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn sagas(&self) -> &SagaOrchestrator {
        &self.sagas
    }

    /// Recovers an agent failure through the agent's escalation ladder.
    /// Unknown agent types fall back to generic recovery.
    ///
    /// The returned payload always carries `operation_id` and
    /// `recovery_method`; degraded results also carry `degraded: true`.
    pub async fn handle_agent_error(
        &self,
        agent_type: &str,
        operation: &str,
        fault: Fault,
        context_data: BTreeMap<String, Value>,
        user_id: Option<&str>,
    ) -> Result<Value, RecoveryError> {
        let mut context = RecoveryContext::new(OperationType::AgentExecution, fault);
        context.metadata = context_data;
        context =
            context.with_metadata("agent_type", agent_type).with_metadata("operation", operation);
        if let Some(user_id) = user_id {
            context = context.with_metadata("user_id", user_id);
        }

        let parsed = match agent_type.parse::<AgentType>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    event_name = "recovery.agent.unknown_type",
                    operation_id = %context.operation_id,
                    agent_type,
                    operation,
                    "no strategy for agent type, using generic recovery"
                );
                context = context.with_metadata("resource", format!("agent:{agent_type}"));
                let result = self.generic(RecoveryOrigin::Agent, &context).await?;
                return Ok(result_payload(&result));
            }
        };

        if let Some(strategy) = self.agents.get(parsed) {
            context = context.with_severity(severity_for(strategy.config().priority));
        }

        match self.agents.recover(parsed, &context).await {
            Ok(recovered) => {
                let degraded = recovered.rung == RecoveryRung::Degraded;
                self.metrics.record_success(RecoveryOrigin::Agent, recovered.rung.as_str(), degraded);

                let mut payload = recovered.payload;
                if let Value::Object(map) = &mut payload {
                    map.insert("operation_id".to_owned(), json!(context.operation_id));
                    map.insert("agent_type".to_owned(), json!(parsed.as_str()));
                    map.entry("recovery_method").or_insert_with(|| json!(recovered.rung.as_str()));
                    if degraded {
                        map.insert("degraded".to_owned(), json!(true));
                    }
                }
                Ok(payload)
            }
            Err(error) => {
                self.metrics.record_failure(RecoveryOrigin::Agent, "exhausted");
                let manual = self
                    .agents
                    .get(parsed)
                    .is_some_and(|strategy| strategy.config().require_manual_intervention);
                if manual {
                    self.metrics.record_manual_intervention();
                }
                Err(error)
            }
        }
    }

    /// Undoes a failed write: through the distributed transaction when one
    /// is given, otherwise through a one-operation rollback session.
    /// Without either the failure is returned unrecovered.
    pub async fn handle_database_error(
        &self,
        table_name: &str,
        operation: &str,
        fault: Fault,
        rollback_data: Option<RollbackData>,
        transaction_id: Option<&TransactionId>,
    ) -> Result<Value, RecoveryError> {
        let context = RecoveryContext::new(OperationType::DatabaseWrite, fault)
            .with_metadata("table", table_name)
            .with_metadata("operation", operation);

        if let Some(transaction_id) = transaction_id {
            let state = self.transactions.rollback_transaction(transaction_id).await?;
            if state != TransactionState::RolledBack {
                self.metrics.record_failure(RecoveryOrigin::Database, "transaction_rollback");
                return Err(RecoveryError::TransactionAborted {
                    transaction_id: transaction_id.clone(),
                    cause: context.fault,
                });
            }
            self.metrics.record_success(RecoveryOrigin::Database, "transaction_rollback", false);
            info!(
                event_name = "recovery.database.rolled_back",
                operation_id = %context.operation_id,
                transaction_id = %transaction_id,
                table = table_name,
                "database failure recovered by transaction rollback"
            );
            return Ok(json!({
                "status": "rolled_back",
                "operation_id": context.operation_id,
                "transaction_id": transaction_id,
                "table": table_name,
                "recovery_method": "transaction_rollback",
            }));
        }

        let Some(rollback_data) = rollback_data else {
            self.metrics.record_failure(RecoveryOrigin::Database, "none");
            return Err(unrecoverable(context));
        };

        let write_kind = WriteKind::parse(operation).ok_or_else(|| {
            RecoveryError::InvalidRollbackData {
                table: table_name.to_owned(),
                reason: format!("`{operation}` is not an insert, update or delete"),
            }
        })?;

        let mut session_metadata = BTreeMap::new();
        session_metadata.insert("operation_id".to_owned(), json!(context.operation_id));
        session_metadata.insert("error".to_owned(), json!(context.fault.to_string()));
        let session_id = self.rollbacks.create_rollback_session(session_metadata).await;
        self.rollbacks
            .add_rollback_operation(&session_id, table_name, write_kind, rollback_data, Vec::new())
            .await?;
        let outcome = self.rollbacks.execute_rollback_session(&session_id).await?;

        if !outcome.completed() {
            self.metrics.record_failure(RecoveryOrigin::Database, "rollback");
            return Err(unrecoverable(context));
        }
        self.metrics.record_success(RecoveryOrigin::Database, "rollback", false);
        Ok(json!({
            "status": "rolled_back",
            "operation_id": context.operation_id,
            "session_id": outcome.session_id,
            "table": table_name,
            "recovery_method": "rollback_session",
        }))
    }

    /// Generic recovery behind the circuit breaker of `"{method} {endpoint}"`.
    pub async fn handle_api_error(
        &self,
        endpoint: &str,
        method: &str,
        fault: Fault,
        status_code: Option<u16>,
    ) -> Result<RecoveryResult, RecoveryError> {
        let fault = match status_code {
            Some(status) => fault.with_status(status),
            None => fault,
        };
        let mut context = RecoveryContext::new(OperationType::ExternalApi, fault)
            .with_metadata("endpoint", endpoint)
            .with_metadata("method", method)
            .with_metadata("resource", api_resource(endpoint, method));
        if let Some(status) = status_code {
            context = context.with_metadata("status_code", status);
        }

        self.generic(RecoveryOrigin::Api, &context).await
    }

    /// Reports a successful call to `endpoint`, closing its circuit.
    pub fn record_api_success(&self, endpoint: &str, method: &str) {
        self.executor.record_success(&api_resource(endpoint, method));
    }

    pub async fn execute_saga_transaction(
        &self,
        name: &str,
        steps: Vec<SagaStep>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<SagaOutcome, RecoveryError> {
        let saga_id = self.sagas.create_saga(name, steps, metadata).await;
        let outcome = self.sagas.execute_saga(&saga_id).await?;
        if outcome.succeeded() {
            self.metrics.record_success(RecoveryOrigin::Saga, "saga", false);
        } else {
            self.metrics.record_failure(RecoveryOrigin::Saga, outcome.state.as_str());
        }
        Ok(outcome)
    }

    pub fn get_recovery_metrics(&self) -> RecoveryMetrics {
        self.metrics.snapshot()
    }

    pub async fn generate_recovery_report(&self) -> RecoveryReport {
        RecoveryReport::build(
            self.metrics.snapshot(),
            self.executor.breakers().snapshot(),
            self.transactions.active_transaction_count().await,
            self.rollbacks.active_session_count().await,
            self.sagas.active_saga_count().await,
        )
    }

    async fn generic(
        &self,
        origin: RecoveryOrigin,
        context: &RecoveryContext,
    ) -> Result<RecoveryResult, RecoveryError> {
        let result = match self.executor.attempt_recovery(context).await {
            Ok(result) => result,
            Err(error) => {
                if matches!(error, RecoveryError::CircuitOpen { .. }) {
                    self.metrics.record_circuit_rejection(origin);
                }
                return Err(error);
            }
        };

        if result.success {
            self.metrics.record_success(origin, result.action.as_str(), false);
            Ok(result)
        } else {
            self.metrics.record_failure(origin, result.action.as_str());
            Err(unrecoverable(context.clone()))
        }
    }
}

fn api_resource(endpoint: &str, method: &str) -> String {
    format!("{} {endpoint}", method.to_ascii_uppercase())
}

fn unrecoverable(context: RecoveryContext) -> RecoveryError {
    RecoveryError::Unrecoverable { operation_id: context.operation_id, cause: context.fault }
}

fn result_payload(result: &RecoveryResult) -> Value {
    json!({
        "operation_id": result.operation_id,
        "recovery_method": result.action.as_str(),
        "strategy": result.strategy,
        "retry_delay_ms": result.retry_delay.map(|delay| delay.as_millis() as u64),
    })
}

fn severity_for(priority: Priority) -> Severity {
    match priority {
        Priority::Low => Severity::Low,
        Priority::Medium => Severity::Medium,
        Priority::High => Severity::High,
        Priority::Critical => Severity::Critical,
    }
}
