use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::domain::context::OperationId;
use crate::errors::{Fault, RecoveryError};
use crate::rollback::graph::plan_batches;
use crate::rollback::{
    RollbackData, RollbackExecutor, RollbackOperation, RollbackOperationState, RollbackSession,
    RollbackSessionState, SessionId, StoreKind, WriteKind,
};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedRollback {
    pub operation_id: OperationId,
    pub table_name: String,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub session_id: SessionId,
    pub state: RollbackSessionState,
    pub succeeded: Vec<OperationId>,
    pub failed: Vec<FailedRollback>,
    pub batches: usize,
    pub expired: bool,
}

impl RollbackOutcome {
    pub fn completed(&self) -> bool {
        self.state == RollbackSessionState::Completed
    }
}

/// Collects undo operations per session and executes them in dependency
/// order against store-specific executors.
pub struct RollbackManager {
    sessions: RwLock<HashMap<SessionId, RollbackSession>>,
    executors: HashMap<StoreKind, Arc<dyn RollbackExecutor>>,
    session_timeout: Duration,
}

impl Default for RollbackManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

impl RollbackManager {
    pub fn new(session_timeout: Duration) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), executors: HashMap::new(), session_timeout }
    }

    /// Registers the executor for the store it reports; replaces any previous one.
    pub fn with_executor(mut self, executor: Arc<dyn RollbackExecutor>) -> Self {
        self.executors.insert(executor.store(), executor);
        self
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session(&self, session_id: &SessionId) -> Option<RollbackSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn create_rollback_session(&self, metadata: BTreeMap<String, Value>) -> SessionId {
        let session = RollbackSession::new(self.session_timeout, metadata);
        let session_id = session.session_id.clone();
        self.sessions.write().await.insert(session_id.clone(), session);
        info!(
            event_name = "recovery.rollback.session_created",
            session_id = %session_id,
            timeout_secs = self.session_timeout.as_secs(),
            "rollback session created"
        );
        session_id
    }

    pub async fn add_rollback_operation(
        &self,
        session_id: &SessionId,
        table_name: &str,
        operation_type: WriteKind,
        rollback_data: RollbackData,
        dependencies: Vec<OperationId>,
    ) -> Result<OperationId, RecoveryError> {
        rollback_data.validate(operation_type).map_err(|reason| {
            RecoveryError::InvalidRollbackData { table: table_name.to_owned(), reason }
        })?;

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RecoveryError::SessionNotFound(session_id.clone()))?;

        let operation_id = OperationId::generate();
        let sequence = session.operations.len() as u64;
        let operation = RollbackOperation::new(
            operation_id.clone(),
            table_name,
            operation_type,
            rollback_data,
            sequence,
        )
        .with_dependencies(dependencies);

        for existing in &mut session.operations {
            if operation.dependencies.contains(&existing.operation_id) {
                existing.dependents.insert(operation_id.clone());
            }
        }
        session.operations.push(operation);

        Ok(operation_id)
    }

    /// Executes and removes the session. Expiry is reported but not enforced.
    pub async fn execute_rollback_session(
        &self,
        session_id: &SessionId,
    ) -> Result<RollbackOutcome, RecoveryError> {
        let mut session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| RecoveryError::SessionNotFound(session_id.clone()))?;

        let expired = session.is_expired();
        if expired {
            warn!(
                event_name = "recovery.rollback.session_expired",
                session_id = %session_id,
                timeout_secs = session.timeout.as_secs(),
                "executing rollback session past its timeout"
            );
        }

        session.state = RollbackSessionState::Executing;
        let stores = session.stores();
        for store in &stores {
            if let Some(executor) = self.executors.get(store) {
                if let Err(fault) = executor.begin(session_id).await {
                    warn!(
                        event_name = "recovery.rollback.begin_failed",
                        session_id = %session_id,
                        store = store.as_str(),
                        error = %fault,
                        "store executor could not open the session"
                    );
                }
            }
        }

        let batches = plan_batches(&session.operations);
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for batch in &batches {
            let planned: Vec<RollbackOperation> = batch
                .iter()
                .filter_map(|operation_id| {
                    session
                        .operations
                        .iter()
                        .find(|operation| &operation.operation_id == operation_id)
                        .cloned()
                })
                .collect();

            let results = join_all(planned.iter().map(|operation| self.apply(session_id, operation)))
                .await;

            for (operation, result) in planned.iter().zip(results) {
                let state = match &result {
                    Ok(()) => RollbackOperationState::Completed,
                    Err(_) => RollbackOperationState::Failed,
                };
                if let Some(stored) = session
                    .operations
                    .iter_mut()
                    .find(|stored| stored.operation_id == operation.operation_id)
                {
                    stored.state = state;
                    stored.error = result.as_ref().err().map(ToString::to_string);
                }
                match result {
                    Ok(()) => succeeded.push(operation.operation_id.clone()),
                    Err(fault) => failed.push(FailedRollback {
                        operation_id: operation.operation_id.clone(),
                        table_name: operation.table_name.clone(),
                        error: fault.to_string(),
                    }),
                }
            }
        }

        let state = if failed.is_empty() {
            RollbackSessionState::Completed
        } else if succeeded.is_empty() {
            RollbackSessionState::Failed
        } else {
            RollbackSessionState::Partial
        };
        session.state = state;

        for store in &stores {
            let Some(executor) = self.executors.get(store) else {
                continue;
            };
            let finish = if state == RollbackSessionState::Failed {
                executor.abort(session_id).await
            } else {
                executor.commit(session_id).await
            };
            if let Err(fault) = finish {
                error!(
                    event_name = "recovery.rollback.finish_failed",
                    session_id = %session_id,
                    store = store.as_str(),
                    state = state.as_str(),
                    error = %fault,
                    "store executor could not finish the session"
                );
            }
        }

        let outcome = RollbackOutcome {
            session_id: session_id.clone(),
            state,
            succeeded,
            failed,
            batches: batches.len(),
            expired,
        };

        match state {
            RollbackSessionState::Completed => info!(
                event_name = "recovery.rollback.completed",
                session_id = %session_id,
                operations = outcome.succeeded.len(),
                batches = outcome.batches,
                "rollback session completed"
            ),
            _ => warn!(
                event_name = "recovery.rollback.incomplete",
                session_id = %session_id,
                state = state.as_str(),
                succeeded = outcome.succeeded.len(),
                failed = outcome.failed.len(),
                "rollback session finished with failures"
            ),
        }

        Ok(outcome)
    }

    async fn apply(&self, session_id: &SessionId, operation: &RollbackOperation) -> Result<(), Fault> {
        let store = operation.rollback_data.store;
        let executor = self.executors.get(&store).ok_or_else(|| {
            Fault::runtime(format!("no rollback executor registered for {} store", store.as_str()))
        })?;

        executor.apply(session_id, operation).await.map_err(|fault| {
            warn!(
                event_name = "recovery.rollback.operation_failed",
                session_id = %session_id,
                operation_id = %operation.operation_id,
                table = %operation.table_name,
                write = operation.operation_type.as_str(),
                error = %fault,
                "rollback operation failed"
            );
            fault
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::Value;

    use super::RollbackManager;
    use crate::errors::RecoveryError;
    use crate::rollback::{
        InMemoryRollbackExecutor, RollbackData, RollbackSessionState, SessionId, StoreKind,
        WriteKind,
    };

    fn key(id: i64) -> BTreeMap<String, Value> {
        BTreeMap::from([("id".to_owned(), Value::from(id))])
    }

    fn row(id: i64, status: &str) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("id".to_owned(), Value::from(id)),
            ("status".to_owned(), Value::from(status)),
        ])
    }

    #[tokio::test]
    async fn inverts_writes_and_removes_session() {
        let store = Arc::new(InMemoryRollbackExecutor::new(StoreKind::Relational));
        store.seed("agent_runs", row(1, "inserted")).await;
        store.seed("agent_runs", row(2, "running")).await;
        let manager = RollbackManager::default().with_executor(store.clone());

        let session = manager.create_rollback_session(BTreeMap::new()).await;
        manager
            .add_rollback_operation(
                &session,
                "agent_runs",
                WriteKind::Insert,
                RollbackData::for_insert(StoreKind::Relational, key(1)),
                Vec::new(),
            )
            .await
            .expect("insert rollback");
        manager
            .add_rollback_operation(
                &session,
                "agent_runs",
                WriteKind::Update,
                RollbackData::for_update(StoreKind::Relational, key(2), row(2, "queued")),
                Vec::new(),
            )
            .await
            .expect("update rollback");
        manager
            .add_rollback_operation(
                &session,
                "agent_runs",
                WriteKind::Delete,
                RollbackData::for_delete(StoreKind::Relational, key(3), row(3, "archived")),
                Vec::new(),
            )
            .await
            .expect("delete rollback");

        let outcome = manager.execute_rollback_session(&session).await.expect("execute");

        assert!(outcome.completed());
        assert_eq!(outcome.batches, 2);
        let rows = store.rows("agent_runs").await;
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&row(2, "queued")));
        assert!(rows.contains(&row(3, "archived")));
        assert_eq!(manager.active_session_count().await, 0);
        assert!(matches!(
            manager.execute_rollback_session(&session).await,
            Err(RecoveryError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reports_partial_and_failed_sessions() {
        let relational = Arc::new(InMemoryRollbackExecutor::new(StoreKind::Relational));
        let analytics =
            Arc::new(InMemoryRollbackExecutor::new(StoreKind::Analytics).failing_on("events"));
        let manager =
            RollbackManager::default().with_executor(relational).with_executor(analytics);

        let partial = manager.create_rollback_session(BTreeMap::new()).await;
        for (table, store) in [("agent_runs", StoreKind::Relational), ("events", StoreKind::Analytics)]
        {
            manager
                .add_rollback_operation(
                    &partial,
                    table,
                    WriteKind::Insert,
                    RollbackData::for_insert(store, key(1)),
                    Vec::new(),
                )
                .await
                .expect("add");
        }
        let outcome = manager.execute_rollback_session(&partial).await.expect("execute");
        assert_eq!(outcome.state, RollbackSessionState::Partial);
        assert!(!outcome.completed());
        assert_eq!(outcome.failed[0].table_name, "events");

        let failed = manager.create_rollback_session(BTreeMap::new()).await;
        manager
            .add_rollback_operation(
                &failed,
                "events",
                WriteKind::Insert,
                RollbackData::for_insert(StoreKind::Analytics, key(9)),
                Vec::new(),
            )
            .await
            .expect("add");
        let outcome = manager.execute_rollback_session(&failed).await.expect("execute");
        assert_eq!(outcome.state, RollbackSessionState::Failed);
    }

    #[tokio::test]
    async fn missing_executor_fails_the_operation() {
        let manager = RollbackManager::default();
        let session = manager.create_rollback_session(BTreeMap::new()).await;
        manager
            .add_rollback_operation(
                &session,
                "agent_runs",
                WriteKind::Insert,
                RollbackData::for_insert(StoreKind::Relational, key(1)),
                Vec::new(),
            )
            .await
            .expect("add");

        let outcome = manager.execute_rollback_session(&session).await.expect("execute");

        assert_eq!(outcome.state, RollbackSessionState::Failed);
        assert!(outcome.failed[0].error.contains("no rollback executor"));
    }

    #[tokio::test]
    async fn expired_sessions_still_execute() {
        let store = Arc::new(InMemoryRollbackExecutor::new(StoreKind::Relational));
        let manager = RollbackManager::new(Duration::ZERO).with_executor(store);
        let session = manager.create_rollback_session(BTreeMap::new()).await;
        manager
            .add_rollback_operation(
                &session,
                "agent_runs",
                WriteKind::Insert,
                RollbackData::for_insert(StoreKind::Relational, key(1)),
                Vec::new(),
            )
            .await
            .expect("add");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let outcome = manager.execute_rollback_session(&session).await.expect("execute");

        assert!(outcome.expired);
        assert!(outcome.completed());
    }

    #[tokio::test]
    async fn rejects_incomplete_images_and_unknown_sessions() {
        let manager = RollbackManager::default();
        let session = manager.create_rollback_session(BTreeMap::new()).await;

        let missing_image = manager
            .add_rollback_operation(
                &session,
                "agent_runs",
                WriteKind::Delete,
                RollbackData::for_insert(StoreKind::Relational, key(1)),
                Vec::new(),
            )
            .await;
        assert!(matches!(missing_image, Err(RecoveryError::InvalidRollbackData { .. })));

        let unknown = manager
            .add_rollback_operation(
                &SessionId("nope".to_owned()),
                "agent_runs",
                WriteKind::Insert,
                RollbackData::for_insert(StoreKind::Relational, key(1)),
                Vec::new(),
            )
            .await;
        assert!(matches!(unknown, Err(RecoveryError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn explicit_dependencies_record_dependents() {
        let manager = RollbackManager::default();
        let session = manager.create_rollback_session(BTreeMap::new()).await;
        let parent = manager
            .add_rollback_operation(
                &session,
                "agents",
                WriteKind::Insert,
                RollbackData::for_insert(StoreKind::Relational, key(1)),
                Vec::new(),
            )
            .await
            .expect("parent");
        let child = manager
            .add_rollback_operation(
                &session,
                "agent_runs",
                WriteKind::Insert,
                RollbackData::for_insert(StoreKind::Relational, key(1)),
                vec![parent.clone()],
            )
            .await
            .expect("child");

        let snapshot = manager.session(&session).await.expect("session");
        assert!(snapshot.operations[0].dependents.contains(&child));
        assert!(snapshot.operations[1].dependencies.contains(&parent));
    }
}
