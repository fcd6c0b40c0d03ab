use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::context::{OperationId, OperationType};
use crate::domain::operation::{Operation, OperationState};
use crate::errors::Fault;

pub const DEFAULT_COMPENSATION_CONCURRENCY: usize = 5;

/// Semantically undoes one completed operation. Implementations are expected
/// to be idempotent; the executor never re-runs an action by itself.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(
        &self,
        operation_id: &OperationId,
        data: &BTreeMap<String, Value>,
    ) -> Result<(), Fault>;
}

/// Adapts an async closure into a [`CompensationHandler`].
pub struct FnCompensationHandler<F> {
    func: F,
}

impl<F> FnCompensationHandler<F> {
    pub fn new<Fut>(func: F) -> Self
    where
        F: Fn(OperationId, BTreeMap<String, Value>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), Fault>> + Send,
    {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> CompensationHandler for FnCompensationHandler<F>
where
    F: Fn(OperationId, BTreeMap<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Fault>> + Send,
{
    async fn compensate(
        &self,
        operation_id: &OperationId,
        data: &BTreeMap<String, Value>,
    ) -> Result<(), Fault> {
        (self.func)(operation_id.clone(), data.clone()).await
    }
}

/// Relational stores undo through their own transaction rollback, so the
/// database handlers only leave a trace.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeRollbackHandler {
    operation_type: Option<OperationType>,
}

impl NativeRollbackHandler {
    pub fn new(operation_type: OperationType) -> Self {
        Self { operation_type: Some(operation_type) }
    }
}

#[async_trait]
impl CompensationHandler for NativeRollbackHandler {
    async fn compensate(
        &self,
        operation_id: &OperationId,
        data: &BTreeMap<String, Value>,
    ) -> Result<(), Fault> {
        debug!(
            event_name = "recovery.compensation.native_rollback",
            operation_id = %operation_id,
            operation_type = self.operation_type.map(|kind| kind.as_str()).unwrap_or("unknown"),
            table = data.get("table").and_then(|value| value.as_str()).unwrap_or(""),
            "relying on store-native rollback"
        );
        Ok(())
    }
}

pub struct CompensationRegistry {
    handlers: RwLock<HashMap<OperationType, Arc<dyn CompensationHandler>>>,
}

impl CompensationRegistry {
    pub fn empty() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }

    /// Registry with the default database read/write handlers.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        for operation_type in [OperationType::DatabaseRead, OperationType::DatabaseWrite] {
            registry.register(operation_type, Arc::new(NativeRollbackHandler::new(operation_type)));
        }
        registry
    }

    /// Replaces any handler already registered for `operation_type`.
    pub fn register(&self, operation_type: OperationType, handler: Arc<dyn CompensationHandler>) {
        let mut handlers = match self.handlers.write() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(operation_type, handler);
    }

    pub fn get_handler(&self, operation_type: OperationType) -> Option<Arc<dyn CompensationHandler>> {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(&operation_type).cloned()
    }

    pub fn create_action(
        &self,
        operation_id: OperationId,
        operation_type: OperationType,
        compensation_data: BTreeMap<String, Value>,
    ) -> CompensationAction {
        CompensationAction {
            action_id: Uuid::new_v4().to_string(),
            operation_id,
            operation_type,
            compensation_data,
            handler: self.get_handler(operation_type),
            state: CompensationState::Pending,
            error: None,
            created_at: Utc::now(),
            executed_at: None,
        }
    }
}

impl Default for CompensationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationState {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

/// Single-use compensation bound to the handler found at creation time.
#[derive(Clone)]
pub struct CompensationAction {
    pub action_id: String,
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub compensation_data: BTreeMap<String, Value>,
    handler: Option<Arc<dyn CompensationHandler>>,
    pub state: CompensationState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl CompensationAction {
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

impl fmt::Debug for CompensationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensationAction")
            .field("action_id", &self.action_id)
            .field("operation_id", &self.operation_id)
            .field("operation_type", &self.operation_type)
            .field("state", &self.state)
            .field("has_handler", &self.handler.is_some())
            .field("error", &self.error)
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationSummary {
    pub compensated: Vec<OperationId>,
    pub failed: Vec<OperationId>,
    pub skipped: Vec<OperationId>,
}

impl CompensationSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompensationResult {
    Compensated,
    Failed,
    Skipped,
}

pub struct CompensationExecutor {
    registry: Arc<CompensationRegistry>,
    concurrency: usize,
}

impl CompensationExecutor {
    pub fn new(registry: Arc<CompensationRegistry>) -> Self {
        Self { registry, concurrency: DEFAULT_COMPENSATION_CONCURRENCY }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<CompensationRegistry> {
        &self.registry
    }

    /// Compensates one completed operation. Handler failures are logged and
    /// leave the operation state untouched.
    pub async fn execute_for_operation(&self, operation: &mut Operation) -> CompensationResult {
        if operation.state != OperationState::Completed {
            debug!(
                event_name = "recovery.compensation.not_applicable",
                operation_id = %operation.operation_id,
                state = operation.state.as_str(),
                "only completed operations are compensated"
            );
            return CompensationResult::Skipped;
        }

        let Some(handler) = self.registry.get_handler(operation.operation_type) else {
            warn!(
                event_name = "recovery.compensation.no_handler",
                operation_id = %operation.operation_id,
                operation_type = %operation.operation_type,
                "no compensation handler registered"
            );
            return CompensationResult::Skipped;
        };

        match handler.compensate(&operation.operation_id, &operation.metadata).await {
            Ok(()) => {
                operation.mark_compensated();
                info!(
                    event_name = "recovery.compensation.completed",
                    operation_id = %operation.operation_id,
                    operation_type = %operation.operation_type,
                    "operation compensated"
                );
                CompensationResult::Compensated
            }
            Err(fault) => {
                warn!(
                    event_name = "recovery.compensation.failed",
                    operation_id = %operation.operation_id,
                    operation_type = %operation.operation_type,
                    error = %fault,
                    "compensation handler failed"
                );
                CompensationResult::Failed
            }
        }
    }

    /// Compensates every completed operation, newest first.
    pub async fn compensate_reverse(&self, operations: &mut [Operation]) -> CompensationSummary {
        let mut summary = CompensationSummary::default();
        for operation in operations.iter_mut().rev() {
            if operation.state != OperationState::Completed {
                continue;
            }
            let operation_id = operation.operation_id.clone();
            match self.execute_for_operation(operation).await {
                CompensationResult::Compensated => summary.compensated.push(operation_id),
                CompensationResult::Failed => summary.failed.push(operation_id),
                CompensationResult::Skipped => summary.skipped.push(operation_id),
            }
        }
        summary
    }

    pub async fn execute_action(&self, mut action: CompensationAction) -> CompensationAction {
        if action.state != CompensationState::Pending {
            return action;
        }
        let Some(handler) = action.handler.clone() else {
            action.state = CompensationState::Skipped;
            warn!(
                event_name = "recovery.compensation.no_handler",
                operation_id = %action.operation_id,
                action_id = %action.action_id,
                operation_type = %action.operation_type,
                "compensation action skipped"
            );
            return action;
        };

        action.state = CompensationState::Executing;
        let result = handler.compensate(&action.operation_id, &action.compensation_data).await;
        action.executed_at = Some(Utc::now());
        match result {
            Ok(()) => action.state = CompensationState::Completed,
            Err(fault) => {
                warn!(
                    event_name = "recovery.compensation.failed",
                    operation_id = %action.operation_id,
                    action_id = %action.action_id,
                    error = %fault,
                    "compensation action failed"
                );
                action.state = CompensationState::Failed;
                action.error = Some(fault.to_string());
            }
        }
        action
    }

    /// Runs actions concurrently with at most `concurrency` in flight.
    /// Results come back in input order.
    pub async fn execute_batch(&self, actions: Vec<CompensationAction>) -> Vec<CompensationAction> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let tasks = actions.into_iter().map(|action| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await;
                self.execute_action(action).await
            }
        });
        join_all(tasks).await
    }
}
