use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mender_core::rollback::{RollbackOperation, SessionId};
use mender_core::{Fault, RollbackExecutor, StoreKind, WriteKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::sql::{bind_all, from_json, key_predicate, quote_identifier, to_json};
use crate::DbPool;

/// Undoes relational writes inside one SQL transaction per rollback session.
///
/// Statements run on the session's transaction; `commit` makes every
/// successful inversion visible at once and `abort` discards them.
pub struct SqlRollbackExecutor {
    pool: DbPool,
    sessions: Mutex<HashMap<SessionId, Transaction<'static, Sqlite>>>,
}

impl SqlRollbackExecutor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, sessions: Mutex::new(HashMap::new()) }
    }

    pub async fn open_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn invert(
        &self,
        session_id: &SessionId,
        operation: &RollbackOperation,
    ) -> Result<(), RepositoryError> {
        let statement = InverseStatement::for_operation(operation)?;

        let mut sessions = self.sessions.lock().await;
        let transaction = sessions
            .get_mut(session_id)
            .ok_or_else(|| RepositoryError::NoOpenTransaction(session_id.to_string()))?;

        let result =
            bind_all(sqlx::query(&statement.sql), &statement.binds).execute(&mut **transaction).await?;

        if operation.operation_type == WriteKind::Update && result.rows_affected() == 0 {
            return Err(RepositoryError::RowMissing { table: operation.table_name.clone() });
        }

        debug!(
            event_name = "recovery.rollback.sql.applied",
            session_id = %session_id,
            operation_id = %operation.operation_id,
            table = %operation.table_name,
            write = operation.operation_type.as_str(),
            rows = result.rows_affected(),
            "inverse statement executed"
        );
        Ok(())
    }
}

#[async_trait]
impl RollbackExecutor for SqlRollbackExecutor {
    fn store(&self) -> StoreKind {
        StoreKind::Relational
    }

    async fn begin(&self, session_id: &SessionId) -> Result<(), Fault> {
        let transaction = self.pool.begin().await.map_err(RepositoryError::from)?;
        self.sessions.lock().await.insert(session_id.clone(), transaction);
        Ok(())
    }

    async fn apply(
        &self,
        session_id: &SessionId,
        operation: &RollbackOperation,
    ) -> Result<(), Fault> {
        self.invert(session_id, operation).await.map_err(Fault::from)
    }

    async fn commit(&self, session_id: &SessionId) -> Result<(), Fault> {
        let transaction = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| RepositoryError::NoOpenTransaction(session_id.to_string()))?;
        transaction.commit().await.map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn abort(&self, session_id: &SessionId) -> Result<(), Fault> {
        let Some(transaction) = self.sessions.lock().await.remove(session_id) else {
            return Ok(());
        };
        transaction.rollback().await.map_err(RepositoryError::from)?;
        Ok(())
    }
}

struct InverseStatement {
    sql: String,
    binds: Vec<Value>,
}

impl InverseStatement {
    fn for_operation(operation: &RollbackOperation) -> Result<Self, RepositoryError> {
        let table = quote_identifier(&operation.table_name)?;
        let data = &operation.rollback_data;
        if data.primary_key.is_empty() {
            return Err(RepositoryError::IncompleteImage {
                table: operation.table_name.clone(),
                write: operation.operation_type.as_str(),
            });
        }
        let (predicate, key_binds) = key_predicate(&data.primary_key)?;

        match operation.operation_type {
            WriteKind::Insert => {
                Ok(Self { sql: format!("DELETE FROM {table} WHERE {predicate}"), binds: key_binds })
            }
            WriteKind::Update => {
                let original = original_row(operation)?;
                let mut assignments = Vec::new();
                let mut binds = Vec::new();
                for (column, value) in
                    original.iter().filter(|(column, _)| !data.primary_key.contains_key(*column))
                {
                    assignments.push(format!("{} = ?", quote_identifier(column)?));
                    binds.push(value.clone());
                }
                if assignments.is_empty() {
                    return Err(RepositoryError::IncompleteImage {
                        table: operation.table_name.clone(),
                        write: operation.operation_type.as_str(),
                    });
                }
                binds.extend(key_binds);
                Ok(Self {
                    sql: format!("UPDATE {table} SET {} WHERE {predicate}", assignments.join(", ")),
                    binds,
                })
            }
            WriteKind::Delete => {
                let mut row = original_row(operation)?.clone();
                for (column, value) in &data.primary_key {
                    row.entry(column.clone()).or_insert_with(|| value.clone());
                }
                let columns = row
                    .keys()
                    .map(|column| quote_identifier(column))
                    .collect::<Result<Vec<_>, _>>()?;
                let placeholders = vec!["?"; columns.len()].join(", ");
                Ok(Self {
                    sql: format!(
                        "INSERT INTO {table} ({}) VALUES ({placeholders})",
                        columns.join(", ")
                    ),
                    binds: row.into_values().collect(),
                })
            }
        }
    }
}

fn original_row(
    operation: &RollbackOperation,
) -> Result<&BTreeMap<String, Value>, RepositoryError> {
    match &operation.rollback_data.original_data {
        Some(original) if !original.is_empty() => Ok(original),
        _ => Err(RepositoryError::IncompleteImage {
            table: operation.table_name.clone(),
            write: operation.operation_type.as_str(),
        }),
    }
}

/// What a reader of the analytics table must do with the keyed row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// The row was inserted by the undone write and must be ignored.
    Deletion,
    /// The row was updated; `payload` holds the values to read instead.
    Correction,
    /// The row was deleted; `payload` holds the row to read back.
    Restore,
}

impl MarkerKind {
    pub fn for_write(write: WriteKind) -> Self {
        match write {
            WriteKind::Insert => Self::Deletion,
            WriteKind::Update => Self::Correction,
            WriteKind::Delete => Self::Restore,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deletion => "deletion",
            Self::Correction => "correction",
            Self::Restore => "restore",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deletion" => Some(Self::Deletion),
            "correction" => Some(Self::Correction),
            "restore" => Some(Self::Restore),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsMarker {
    pub id: String,
    pub session_id: SessionId,
    pub operation_id: String,
    pub table_name: String,
    pub marker_kind: MarkerKind,
    pub primary_key: BTreeMap<String, Value>,
    pub payload: Option<BTreeMap<String, Value>>,
    pub created_at: DateTime<Utc>,
}

/// Rolls back analytics writes by appending marker rows; the store itself
/// has no transactions, so `begin` and `commit` have nothing to do.
pub struct AnalyticsMarkerExecutor {
    pool: DbPool,
}

impl AnalyticsMarkerExecutor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn markers_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<AnalyticsMarker>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, session_id, operation_id, table_name, marker_kind,
                    primary_key_json, payload_json, created_at
             FROM analytics_rollback_marker
             WHERE session_id = ?
             ORDER BY created_at, rowid",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(marker_from_row).collect()
    }

    pub async fn markers_for_table(
        &self,
        table_name: &str,
    ) -> Result<Vec<AnalyticsMarker>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, session_id, operation_id, table_name, marker_kind,
                    primary_key_json, payload_json, created_at
             FROM analytics_rollback_marker
             WHERE table_name = ?
             ORDER BY created_at, rowid",
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(marker_from_row).collect()
    }

    async fn insert_marker(
        &self,
        session_id: &SessionId,
        operation: &RollbackOperation,
    ) -> Result<(), RepositoryError> {
        let data = &operation.rollback_data;
        let marker_kind = MarkerKind::for_write(operation.operation_type);
        let payload = match marker_kind {
            MarkerKind::Deletion => None,
            MarkerKind::Correction | MarkerKind::Restore => {
                Some(to_json(original_row(operation)?)?)
            }
        };

        sqlx::query(
            "INSERT INTO analytics_rollback_marker
                (id, session_id, operation_id, table_name, marker_kind,
                 primary_key_json, payload_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&session_id.0)
        .bind(&operation.operation_id.0)
        .bind(&operation.table_name)
        .bind(marker_kind.as_str())
        .bind(to_json(&data.primary_key)?)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            event_name = "recovery.rollback.analytics.marked",
            session_id = %session_id,
            operation_id = %operation.operation_id,
            table = %operation.table_name,
            marker = marker_kind.as_str(),
            "analytics rollback marker written"
        );
        Ok(())
    }
}

#[async_trait]
impl RollbackExecutor for AnalyticsMarkerExecutor {
    fn store(&self) -> StoreKind {
        StoreKind::Analytics
    }

    async fn begin(&self, _session_id: &SessionId) -> Result<(), Fault> {
        Ok(())
    }

    async fn apply(
        &self,
        session_id: &SessionId,
        operation: &RollbackOperation,
    ) -> Result<(), Fault> {
        self.insert_marker(session_id, operation).await.map_err(Fault::from)
    }

    async fn commit(&self, _session_id: &SessionId) -> Result<(), Fault> {
        Ok(())
    }

    async fn abort(&self, session_id: &SessionId) -> Result<(), Fault> {
        let removed = sqlx::query("DELETE FROM analytics_rollback_marker WHERE session_id = ?")
            .bind(&session_id.0)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?
            .rows_affected();
        warn!(
            event_name = "recovery.rollback.analytics.discarded",
            session_id = %session_id,
            removed,
            "analytics rollback markers discarded"
        );
        Ok(())
    }
}

fn marker_from_row(row: SqliteRow) -> Result<AnalyticsMarker, RepositoryError> {
    let marker_kind = row
        .try_get::<String, _>("marker_kind")
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let created_at = row
        .try_get::<String, _>("created_at")
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let payload = row
        .try_get::<Option<String>, _>("payload_json")
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(AnalyticsMarker {
        id: row.try_get("id").map_err(|error| RepositoryError::Decode(error.to_string()))?,
        session_id: SessionId(
            row.try_get("session_id").map_err(|error| RepositoryError::Decode(error.to_string()))?,
        ),
        operation_id: row
            .try_get("operation_id")
            .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        table_name: row
            .try_get("table_name")
            .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        marker_kind: MarkerKind::parse(&marker_kind).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown marker kind `{marker_kind}`"))
        })?,
        primary_key: from_json(
            &row.try_get::<String, _>("primary_key_json")
                .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        )?,
        payload: payload.as_deref().map(from_json).transpose()?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?
            .with_timezone(&Utc),
    })
}
