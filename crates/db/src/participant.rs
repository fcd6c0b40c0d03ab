use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mender_core::{Fault, TransactionId, TransactionParticipant};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::RepositoryError;
use crate::sql::{bind_all, from_json, quote_identifier, to_json};
use crate::DbPool;

/// A row written under a distributed transaction, kept until the
/// transaction is cleaned up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionMarker {
    pub transaction_id: TransactionId,
    pub store: String,
    pub table_name: String,
    pub primary_key: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Relational participant in a distributed transaction: one SQL transaction
/// per `TransactionId`, opened on `begin` and closed by `commit`/`rollback`.
pub struct SqlTransactionParticipant {
    name: String,
    pool: DbPool,
    open: Mutex<HashMap<TransactionId, Transaction<'static, Sqlite>>>,
}

impl SqlTransactionParticipant {
    pub fn new(name: impl Into<String>, pool: DbPool) -> Self {
        Self { name: name.into(), pool, open: Mutex::new(HashMap::new()) }
    }

    pub async fn is_open(&self, transaction_id: &TransactionId) -> bool {
        self.open.lock().await.contains_key(transaction_id)
    }

    /// Runs `sql` on the transaction's connection and returns the affected
    /// row count.
    pub async fn execute_in(
        &self,
        transaction_id: &TransactionId,
        sql: &str,
        binds: &[Value],
    ) -> Result<u64, RepositoryError> {
        let mut open = self.open.lock().await;
        let transaction = open
            .get_mut(transaction_id)
            .ok_or_else(|| RepositoryError::NoOpenTransaction(transaction_id.to_string()))?;

        let result = bind_all(sqlx::query(sql), binds).execute(&mut **transaction).await?;
        Ok(result.rows_affected())
    }

    /// Notes a write made under the transaction. The marker is written on the
    /// transaction itself, so it disappears with a rollback.
    pub async fn record_marker(
        &self,
        transaction_id: &TransactionId,
        table_name: &str,
        primary_key: &BTreeMap<String, Value>,
    ) -> Result<(), RepositoryError> {
        quote_identifier(table_name)?;
        let mut open = self.open.lock().await;
        let transaction = open
            .get_mut(transaction_id)
            .ok_or_else(|| RepositoryError::NoOpenTransaction(transaction_id.to_string()))?;

        sqlx::query(
            "INSERT INTO transaction_marker
                (transaction_id, store, table_name, primary_key_json, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&transaction_id.0)
        .bind(&self.name)
        .bind(table_name)
        .bind(to_json(primary_key)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **transaction)
        .await?;
        Ok(())
    }

    /// Committed markers for the transaction. Reads through the pool, so it
    /// only sees markers of transactions that already committed.
    pub async fn markers(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Vec<TransactionMarker>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT transaction_id, store, table_name, primary_key_json, created_at
             FROM transaction_marker
             WHERE transaction_id = ? AND store = ?
             ORDER BY id",
        )
        .bind(&transaction_id.0)
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(marker_from_row).collect()
    }

    async fn take(
        &self,
        transaction_id: &TransactionId,
    ) -> Option<Transaction<'static, Sqlite>> {
        self.open.lock().await.remove(transaction_id)
    }
}

#[async_trait]
impl TransactionParticipant for SqlTransactionParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn begin(&self, transaction_id: &TransactionId) -> Result<(), Fault> {
        let transaction = self.pool.begin().await.map_err(RepositoryError::from)?;
        self.open.lock().await.insert(transaction_id.clone(), transaction);
        debug!(
            event_name = "recovery.transaction.sql.begin",
            transaction_id = %transaction_id,
            participant = %self.name,
            "sql transaction opened"
        );
        Ok(())
    }

    async fn commit(&self, transaction_id: &TransactionId) -> Result<(), Fault> {
        let transaction = self
            .take(transaction_id)
            .await
            .ok_or_else(|| RepositoryError::NoOpenTransaction(transaction_id.to_string()))?;
        transaction.commit().await.map_err(RepositoryError::from)?;
        Ok(())
    }

    /// Unknown ids are a no-op: a failed `begin` rolls back every
    /// participant, including ones that never opened.
    async fn rollback(&self, transaction_id: &TransactionId) -> Result<(), Fault> {
        let Some(transaction) = self.take(transaction_id).await else {
            return Ok(());
        };
        transaction.rollback().await.map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn purge_markers(&self, transaction_id: &TransactionId) -> Result<(), Fault> {
        let purged =
            sqlx::query("DELETE FROM transaction_marker WHERE transaction_id = ? AND store = ?")
                .bind(&transaction_id.0)
                .bind(&self.name)
                .execute(&self.pool)
                .await
                .map_err(RepositoryError::from)?
                .rows_affected();
        if purged > 0 {
            info!(
                event_name = "recovery.transaction.markers_purged",
                transaction_id = %transaction_id,
                participant = %self.name,
                purged,
                "transaction markers purged"
            );
        }
        Ok(())
    }
}

fn marker_from_row(row: SqliteRow) -> Result<TransactionMarker, RepositoryError> {
    let created_at = row
        .try_get::<String, _>("created_at")
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let primary_key = row
        .try_get::<String, _>("primary_key_json")
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(TransactionMarker {
        transaction_id: TransactionId(
            row.try_get("transaction_id")
                .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        ),
        store: row.try_get("store").map_err(|error| RepositoryError::Decode(error.to_string()))?,
        table_name: row
            .try_get("table_name")
            .map_err(|error| RepositoryError::Decode(error.to_string()))?,
        primary_key: from_json(&primary_key)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use mender_core::{FaultKind, TransactionId, TransactionParticipant};
    use serde_json::json;
    use sqlx::Row;

    use super::SqlTransactionParticipant;
    use crate::error::RepositoryError;
    use crate::{connect_with_settings, migrations::run_pending, DbPool};

    async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");
        sqlx::query("CREATE TABLE workload (id TEXT PRIMARY KEY, cost REAL NOT NULL)")
            .execute(&pool)
            .await
            .expect("create workload");
        pool
    }

    async fn workload_count(pool: &DbPool) -> i64 {
        sqlx::query("SELECT COUNT(*) AS count FROM workload")
            .fetch_one(pool)
            .await
            .expect("count workload")
            .get::<i64, _>("count")
    }

    #[tokio::test]
    async fn commit_keeps_writes_and_markers_until_purged() {
        let pool = pool().await;
        let participant = SqlTransactionParticipant::new("relational", pool.clone());
        let transaction_id = TransactionId::generate();

        participant.begin(&transaction_id).await.expect("begin");
        let rows = participant
            .execute_in(
                &transaction_id,
                "INSERT INTO workload (id, cost) VALUES (?, ?)",
                &[json!("w-1"), json!(0.42)],
            )
            .await
            .expect("insert");
        assert_eq!(rows, 1);
        let key = BTreeMap::from([("id".to_owned(), json!("w-1"))]);
        participant.record_marker(&transaction_id, "workload", &key).await.expect("marker");
        participant.commit(&transaction_id).await.expect("commit");

        assert!(!participant.is_open(&transaction_id).await);
        assert_eq!(workload_count(&pool).await, 1);
        let markers = participant.markers(&transaction_id).await.expect("markers");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].table_name, "workload");
        assert_eq!(markers[0].store, "relational");

        participant.purge_markers(&transaction_id).await.expect("purge");
        assert!(participant.markers(&transaction_id).await.expect("markers").is_empty());
    }

    #[tokio::test]
    async fn rollback_discards_writes_and_markers() {
        let pool = pool().await;
        let participant = SqlTransactionParticipant::new("relational", pool.clone());
        let transaction_id = TransactionId::generate();

        participant.begin(&transaction_id).await.expect("begin");
        participant
            .execute_in(
                &transaction_id,
                "INSERT INTO workload (id, cost) VALUES (?, ?)",
                &[json!("w-2"), json!(1)],
            )
            .await
            .expect("insert");
        let key = BTreeMap::from([("id".to_owned(), json!("w-2"))]);
        participant.record_marker(&transaction_id, "workload", &key).await.expect("marker");
        participant.rollback(&transaction_id).await.expect("rollback");

        assert_eq!(workload_count(&pool).await, 0);
        assert!(participant.markers(&transaction_id).await.expect("markers").is_empty());
        participant.rollback(&transaction_id).await.expect("second rollback is a no-op");
    }

    #[tokio::test]
    async fn statements_need_an_open_transaction() {
        let pool = pool().await;
        let participant = SqlTransactionParticipant::new("relational", pool);
        let transaction_id = TransactionId::generate();

        let result = participant.execute_in(&transaction_id, "SELECT 1", &[]).await;
        assert!(matches!(result, Err(RepositoryError::NoOpenTransaction(_))));

        let commit = participant.commit(&transaction_id).await.expect_err("commit without begin");
        assert_eq!(commit.kind, FaultKind::Coordination);
    }
}
