pub mod graph;
pub mod manager;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::context::OperationId;
use crate::errors::Fault;

pub use graph::plan_batches;
pub use manager::{RollbackManager, RollbackOutcome};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The original write being undone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which store the write landed in; selects the rollback executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Relational,
    Analytics,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Analytics => "analytics",
        }
    }
}

/// Before/after image of one write.
///
/// An insert is undone by deleting `primary_key`; an update restores
/// `original_data`; a delete re-inserts `original_data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollbackData {
    pub store: StoreKind,
    pub primary_key: BTreeMap<String, Value>,
    pub original_data: Option<BTreeMap<String, Value>>,
    pub new_data: Option<BTreeMap<String, Value>>,
}

impl RollbackData {
    pub fn for_insert(store: StoreKind, primary_key: BTreeMap<String, Value>) -> Self {
        Self { store, primary_key, original_data: None, new_data: None }
    }

    pub fn for_update(
        store: StoreKind,
        primary_key: BTreeMap<String, Value>,
        original_data: BTreeMap<String, Value>,
    ) -> Self {
        Self { store, primary_key, original_data: Some(original_data), new_data: None }
    }

    pub fn for_delete(
        store: StoreKind,
        primary_key: BTreeMap<String, Value>,
        original_data: BTreeMap<String, Value>,
    ) -> Self {
        Self { store, primary_key, original_data: Some(original_data), new_data: None }
    }

    pub fn with_new_data(mut self, new_data: BTreeMap<String, Value>) -> Self {
        self.new_data = Some(new_data);
        self
    }

    /// Checks the image carries what inverting `kind` needs.
    pub fn validate(&self, kind: WriteKind) -> Result<(), String> {
        if self.primary_key.is_empty() {
            return Err(format!("{kind} rollback needs a primary key"));
        }
        match kind {
            WriteKind::Insert => Ok(()),
            WriteKind::Update | WriteKind::Delete => match &self.original_data {
                Some(original) if !original.is_empty() => Ok(()),
                _ => Err(format!("{kind} rollback needs original_data")),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOperationState {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// One undo unit inside a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollbackOperation {
    pub operation_id: OperationId,
    pub table_name: String,
    pub operation_type: WriteKind,
    pub rollback_data: RollbackData,
    pub state: RollbackOperationState,
    pub dependencies: BTreeSet<OperationId>,
    pub dependents: BTreeSet<OperationId>,
    pub created_at: DateTime<Utc>,
    /// Creation order within the session; breaks timestamp ties.
    pub sequence: u64,
    pub error: Option<String>,
}

impl RollbackOperation {
    pub fn new(
        operation_id: OperationId,
        table_name: impl Into<String>,
        operation_type: WriteKind,
        rollback_data: RollbackData,
        sequence: u64,
    ) -> Self {
        Self {
            operation_id,
            table_name: table_name.into(),
            operation_type,
            rollback_data,
            state: RollbackOperationState::Pending,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            created_at: Utc::now(),
            sequence,
            error: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = OperationId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    /// Same table and same non-empty primary key.
    pub fn touches_same_row(&self, other: &RollbackOperation) -> bool {
        self.table_name == other.table_name
            && !self.rollback_data.primary_key.is_empty()
            && self.rollback_data.primary_key == other.rollback_data.primary_key
    }

    /// True when `self` was created after `other`.
    pub fn is_newer_than(&self, other: &RollbackOperation) -> bool {
        (self.created_at, self.sequence) > (other.created_at, other.sequence)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackSessionState {
    Pending,
    Executing,
    Completed,
    Partial,
    Failed,
}

impl RollbackSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollbackSession {
    pub session_id: SessionId,
    pub operations: Vec<RollbackOperation>,
    pub state: RollbackSessionState,
    pub timeout: Duration,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl RollbackSession {
    pub fn new(timeout: Duration, metadata: BTreeMap<String, Value>) -> Self {
        Self {
            session_id: SessionId::generate(),
            operations: Vec::new(),
            state: RollbackSessionState::Pending,
            timeout,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.timeout) {
            Ok(timeout) => self.created_at + timeout < now,
            Err(_) => false,
        }
    }

    /// Stores touched by this session, in a stable order.
    pub fn stores(&self) -> BTreeSet<StoreKind> {
        self.operations.iter().map(|operation| operation.rollback_data.store).collect()
    }
}

/// Store-specific undo.
///
/// `begin` opens per-session state, `apply` inverts one write, and the
/// session ends with exactly one of `commit` or `abort`. Operations of one
/// batch may be applied concurrently.
#[async_trait]
pub trait RollbackExecutor: Send + Sync {
    fn store(&self) -> StoreKind;

    async fn begin(&self, session_id: &SessionId) -> Result<(), Fault>;

    async fn apply(&self, session_id: &SessionId, operation: &RollbackOperation)
        -> Result<(), Fault>;

    async fn commit(&self, session_id: &SessionId) -> Result<(), Fault>;

    async fn abort(&self, session_id: &SessionId) -> Result<(), Fault>;
}

/// Keeps rows in memory per table; useful for wiring tests and dry runs.
#[derive(Default)]
pub struct InMemoryRollbackExecutor {
    store: Option<StoreKind>,
    tables: RwLock<HashMap<String, Vec<BTreeMap<String, Value>>>>,
    failing_tables: BTreeSet<String>,
    applied: RwLock<Vec<OperationId>>,
}

impl InMemoryRollbackExecutor {
    pub fn new(store: StoreKind) -> Self {
        Self { store: Some(store), ..Self::default() }
    }

    /// Every apply against `table` fails.
    pub fn failing_on(mut self, table: impl Into<String>) -> Self {
        self.failing_tables.insert(table.into());
        self
    }

    pub async fn seed(&self, table: &str, row: BTreeMap<String, Value>) {
        self.tables.write().await.entry(table.to_owned()).or_default().push(row);
    }

    pub async fn rows(&self, table: &str) -> Vec<BTreeMap<String, Value>> {
        self.tables.read().await.get(table).cloned().unwrap_or_default()
    }

    /// Operation ids in the order they were applied.
    pub async fn applied(&self) -> Vec<OperationId> {
        self.applied.read().await.clone()
    }
}

fn row_matches(row: &BTreeMap<String, Value>, key: &BTreeMap<String, Value>) -> bool {
    key.iter().all(|(column, value)| row.get(column) == Some(value))
}

#[async_trait]
impl RollbackExecutor for InMemoryRollbackExecutor {
    fn store(&self) -> StoreKind {
        self.store.unwrap_or(StoreKind::Relational)
    }

    async fn begin(&self, _session_id: &SessionId) -> Result<(), Fault> {
        Ok(())
    }

    async fn apply(
        &self,
        _session_id: &SessionId,
        operation: &RollbackOperation,
    ) -> Result<(), Fault> {
        if self.failing_tables.contains(&operation.table_name) {
            return Err(Fault::connection(format!(
                "table `{}` is unavailable",
                operation.table_name
            )));
        }

        let data = &operation.rollback_data;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(operation.table_name.clone()).or_default();
        match operation.operation_type {
            WriteKind::Insert => rows.retain(|row| !row_matches(row, &data.primary_key)),
            WriteKind::Update => {
                let original = data.original_data.clone().unwrap_or_default();
                for row in rows.iter_mut().filter(|row| row_matches(row, &data.primary_key)) {
                    row.extend(original.clone());
                }
            }
            WriteKind::Delete => rows.push(data.original_data.clone().unwrap_or_default()),
        }
        drop(tables);

        self.applied.write().await.push(operation.operation_id.clone());
        Ok(())
    }

    async fn commit(&self, _session_id: &SessionId) -> Result<(), Fault> {
        Ok(())
    }

    async fn abort(&self, _session_id: &SessionId) -> Result<(), Fault> {
        Ok(())
    }
}
