use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::compensation::CompensationExecutor;
use crate::domain::context::{OperationId, OperationType};
use crate::domain::operation::{
    Operation, OperationState, Transaction, TransactionId, TransactionState,
};
use crate::errors::{Fault, FaultKind, RecoveryError};

/// A store taking part in distributed transactions.
#[async_trait]
pub trait TransactionParticipant: Send + Sync {
    fn name(&self) -> &str;

    async fn begin(&self, transaction_id: &TransactionId) -> Result<(), Fault>;

    async fn commit(&self, transaction_id: &TransactionId) -> Result<(), Fault>;

    async fn rollback(&self, transaction_id: &TransactionId) -> Result<(), Fault>;

    /// Drops write-store markers left for the transaction. Runs after every
    /// commit or rollback.
    async fn purge_markers(&self, transaction_id: &TransactionId) -> Result<(), Fault>;
}

/// Records calls instead of talking to a store.
#[derive(Default)]
pub struct InMemoryParticipant {
    name: String,
    fail_commit: bool,
    fail_rollback: bool,
    calls: RwLock<Vec<String>>,
}

impl InMemoryParticipant {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    /// `"{call}:{transaction_id}"` in call order.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.read().await.clone()
    }

    async fn record(&self, call: &str, transaction_id: &TransactionId) {
        self.calls.write().await.push(format!("{call}:{transaction_id}"));
    }
}

#[async_trait]
impl TransactionParticipant for InMemoryParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&self, transaction_id: &TransactionId) -> Result<(), Fault> {
        self.record("begin", transaction_id).await;
        Ok(())
    }

    async fn commit(&self, transaction_id: &TransactionId) -> Result<(), Fault> {
        self.record("commit", transaction_id).await;
        if self.fail_commit {
            return Err(Fault::connection(format!("{} commit failed", self.name)));
        }
        Ok(())
    }

    async fn rollback(&self, transaction_id: &TransactionId) -> Result<(), Fault> {
        self.record("rollback", transaction_id).await;
        if self.fail_rollback {
            return Err(Fault::connection(format!("{} rollback failed", self.name)));
        }
        Ok(())
    }

    async fn purge_markers(&self, transaction_id: &TransactionId) -> Result<(), Fault> {
        self.record("purge", transaction_id).await;
        Ok(())
    }
}

/// Coordinates multi-store transactions; completed operations of a rolled
/// back transaction are compensated newest first.
pub struct TransactionManager {
    active: RwLock<HashMap<TransactionId, Transaction>>,
    participants: Vec<Arc<dyn TransactionParticipant>>,
    compensation: Arc<CompensationExecutor>,
}

impl TransactionManager {
    pub fn new(compensation: Arc<CompensationExecutor>) -> Self {
        Self { active: RwLock::new(HashMap::new()), participants: Vec::new(), compensation }
    }

    pub fn with_participant(mut self, participant: Arc<dyn TransactionParticipant>) -> Self {
        self.participants.push(participant);
        self
    }

    pub async fn active_transaction_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn get_transaction(&self, transaction_id: &TransactionId) -> Option<Transaction> {
        self.active.read().await.get(transaction_id).cloned()
    }

    pub async fn begin_transaction(
        &self,
        metadata: BTreeMap<String, Value>,
    ) -> Result<TransactionId, RecoveryError> {
        let transaction = Transaction::new(metadata);
        let transaction_id = transaction.transaction_id.clone();

        for participant in &self.participants {
            if let Err(fault) = participant.begin(&transaction_id).await {
                error!(
                    event_name = "recovery.transaction.begin_failed",
                    transaction_id = %transaction_id,
                    participant = participant.name(),
                    error = %fault,
                    "participant could not begin"
                );
                for started in &self.participants {
                    if let Err(rollback_fault) = started.rollback(&transaction_id).await {
                        warn!(
                            event_name = "recovery.transaction.rollback_failed",
                            transaction_id = %transaction_id,
                            participant = started.name(),
                            error = %rollback_fault,
                            "participant rollback failed"
                        );
                    }
                }
                return Err(RecoveryError::TransactionAborted { transaction_id, cause: fault });
            }
        }

        self.active.write().await.insert(transaction_id.clone(), transaction);
        info!(
            event_name = "recovery.transaction.started",
            transaction_id = %transaction_id,
            participants = self.participants.len(),
            "transaction started"
        );
        Ok(transaction_id)
    }

    pub async fn add_operation(
        &self,
        transaction_id: &TransactionId,
        operation_type: OperationType,
        metadata: BTreeMap<String, Value>,
    ) -> Result<OperationId, RecoveryError> {
        let mut active = self.active.write().await;
        let transaction = active
            .get_mut(transaction_id)
            .ok_or_else(|| RecoveryError::TransactionNotFound(transaction_id.clone()))?;
        if transaction.state != TransactionState::Active {
            return Err(RecoveryError::InvalidState(format!(
                "transaction {transaction_id} is {}",
                transaction.state.as_str()
            )));
        }

        let operation = Operation::new(operation_type, metadata);
        let operation_id = operation.operation_id.clone();
        transaction.operations.push(operation);
        Ok(operation_id)
    }

    pub async fn complete_operation(
        &self,
        transaction_id: &TransactionId,
        operation_id: &OperationId,
    ) -> Result<(), RecoveryError> {
        self.with_operation(transaction_id, operation_id, Operation::mark_completed).await
    }

    pub async fn fail_operation(
        &self,
        transaction_id: &TransactionId,
        operation_id: &OperationId,
        error: impl Into<String>,
    ) -> Result<(), RecoveryError> {
        let error = error.into();
        self.with_operation(transaction_id, operation_id, |operation| operation.mark_failed(error))
            .await
    }

    /// Commits every participant in order. Never fails loudly: a failed
    /// operation or a commit error rolls the transaction back and yields
    /// `false`.
    ///
    /// When a commit fails after earlier participants already committed, only
    /// the rest are rolled back, completed operations are compensated, and the
    /// transaction ends FAILED. The committed participants keep their markers.
    pub async fn commit_transaction(&self, transaction_id: &TransactionId) -> bool {
        let has_failed = match self.active.read().await.get(transaction_id) {
            Some(transaction) => transaction.has_failed_operations(),
            None => {
                warn!(
                    event_name = "recovery.transaction.not_found",
                    transaction_id = %transaction_id,
                    "commit requested for unknown transaction"
                );
                return false;
            }
        };

        if has_failed {
            warn!(
                event_name = "recovery.transaction.commit_refused",
                transaction_id = %transaction_id,
                "transaction has failed operations, rolling back"
            );
            self.rollback_quietly(transaction_id).await;
            return false;
        }

        for (index, participant) in self.participants.iter().enumerate() {
            let Err(fault) = participant.commit(transaction_id).await else {
                continue;
            };

            if index == 0 {
                error!(
                    event_name = "recovery.transaction.commit_failed",
                    transaction_id = %transaction_id,
                    participant = participant.name(),
                    error = %fault,
                    "commit failed, rolling back"
                );
                self.rollback_quietly(transaction_id).await;
                return false;
            }

            let committed: Vec<&str> =
                self.participants[..index].iter().map(|committed| committed.name()).collect();
            error!(
                event_name = "recovery.transaction.partially_committed",
                transaction_id = %transaction_id,
                participant = participant.name(),
                committed = ?committed,
                error = %fault,
                "commit failed after other participants committed, keeping their markers"
            );
            let removed = self.active.write().await.remove(transaction_id);
            if let Some(transaction) = removed {
                self.unwind(transaction_id, transaction, index).await;
            }
            return false;
        }

        let removed = self.active.write().await.remove(transaction_id);
        self.purge_markers(transaction_id, 0).await;
        info!(
            event_name = "recovery.transaction.committed",
            transaction_id = %transaction_id,
            operations = removed.map(|transaction| transaction.operations.len()).unwrap_or(0),
            "transaction committed"
        );
        true
    }

    /// Rolls back every participant, then compensates completed operations
    /// newest first. The transaction leaves the active map either way.
    pub async fn rollback_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<TransactionState, RecoveryError> {
        let transaction = self
            .active
            .write()
            .await
            .remove(transaction_id)
            .ok_or_else(|| RecoveryError::TransactionNotFound(transaction_id.clone()))?;

        Ok(self.unwind(transaction_id, transaction, 0).await)
    }

    /// Rolls back the participants from `committed` on, compensates when all
    /// of those rollbacks succeed, and purges their markers. Anything already
    /// committed leaves the transaction FAILED.
    async fn unwind(
        &self,
        transaction_id: &TransactionId,
        mut transaction: Transaction,
        committed: usize,
    ) -> TransactionState {
        let mut rollback_failed = false;
        for participant in self.participants.iter().skip(committed) {
            if let Err(fault) = participant.rollback(transaction_id).await {
                rollback_failed = true;
                error!(
                    event_name = "recovery.transaction.rollback_failed",
                    transaction_id = %transaction_id,
                    participant = participant.name(),
                    error = %fault,
                    "participant rollback failed"
                );
            }
        }

        if !rollback_failed {
            let summary = self.compensation.compensate_reverse(&mut transaction.operations).await;
            if !summary.failed.is_empty() {
                warn!(
                    event_name = "recovery.transaction.compensation_incomplete",
                    transaction_id = %transaction_id,
                    failed = summary.failed.len(),
                    "some operations could not be compensated"
                );
            }
        }
        transaction.state = if rollback_failed || committed > 0 {
            TransactionState::Failed
        } else {
            TransactionState::RolledBack
        };

        self.purge_markers(transaction_id, committed).await;
        info!(
            event_name = "recovery.transaction.rolled_back",
            transaction_id = %transaction_id,
            state = transaction.state.as_str(),
            compensated = transaction
                .operations
                .iter()
                .filter(|operation| operation.state == OperationState::Compensated)
                .count(),
            "transaction rolled back"
        );
        transaction.state
    }

    /// Runs `body` inside a fresh transaction: commits when it returns `Ok`,
    /// rolls back and reports the body's fault when it returns `Err`.
    pub async fn transaction<T, F, Fut>(
        &self,
        metadata: BTreeMap<String, Value>,
        body: F,
    ) -> Result<T, RecoveryError>
    where
        F: FnOnce(TransactionId) -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let transaction_id = self.begin_transaction(metadata).await?;
        match body(transaction_id.clone()).await {
            Ok(value) => {
                if self.commit_transaction(&transaction_id).await {
                    Ok(value)
                } else {
                    Err(RecoveryError::TransactionAborted {
                        transaction_id,
                        cause: Fault::new(FaultKind::Coordination, "transaction commit failed"),
                    })
                }
            }
            Err(fault) => {
                self.rollback_quietly(&transaction_id).await;
                Err(RecoveryError::TransactionAborted { transaction_id, cause: fault })
            }
        }
    }

    async fn rollback_quietly(&self, transaction_id: &TransactionId) {
        if let Err(error) = self.rollback_transaction(transaction_id).await {
            warn!(
                event_name = "recovery.transaction.rollback_skipped",
                transaction_id = %transaction_id,
                error = %error,
                "rollback could not run"
            );
        }
    }

    /// Purges markers of every participant after the first `skip`.
    async fn purge_markers(&self, transaction_id: &TransactionId, skip: usize) {
        for participant in self.participants.iter().skip(skip) {
            if let Err(fault) = participant.purge_markers(transaction_id).await {
                warn!(
                    event_name = "recovery.transaction.purge_failed",
                    transaction_id = %transaction_id,
                    participant = participant.name(),
                    error = %fault,
                    "marker purge failed"
                );
            }
        }
    }

    async fn with_operation<F>(
        &self,
        transaction_id: &TransactionId,
        operation_id: &OperationId,
        update: F,
    ) -> Result<(), RecoveryError>
    where
        F: FnOnce(&mut Operation),
    {
        let mut active = self.active.write().await;
        let transaction = active
            .get_mut(transaction_id)
            .ok_or_else(|| RecoveryError::TransactionNotFound(transaction_id.clone()))?;
        let operation = transaction.operation_mut(operation_id).ok_or_else(|| {
            RecoveryError::OperationNotFound {
                transaction_id: transaction_id.clone(),
                operation_id: operation_id.clone(),
            }
        })?;
        update(operation);
        Ok(())
    }
}
