use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsc_common::types::{
    ChunkCheckpoint, FailureCause, FailureKind, TransferId, TransferState,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, instrument};

use super::{TransferRecord, TransferStore};
use crate::descriptor::{Credentials, EndpointReferenceEntry, TransferDescriptor};
use crate::error::{Result, TransferError};

const SELECT_RECORD: &str = r#"
    SELECT t.transfer_id, t.descriptor, t.state, t.failure_kind, t.failure_message,
           t.updated_at, c.byte_offset, c.content_hash, c.recorded_at
    FROM transfers t
    JOIN checkpoints c ON c.transfer_id = t.transfer_id
"#;

/// SQLite-backed store. Every write is committed with `synchronous=FULL`
/// before the call returns.
#[derive(Clone)]
pub struct SqliteTransferStore {
    pool: SqlitePool,
}

impl SqliteTransferStore {
    /// Open (creating if needed) the database at `database_url` and run the
    /// embedded migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(database_url, "Connected to transfer state database");
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_db(offset: u64) -> Result<i64> {
    i64::try_from(offset)
        .map_err(|_| TransferError::permanent(format!("offset {offset} does not fit the store")))
}

fn from_db(offset: i64, id: &str) -> Result<u64> {
    u64::try_from(offset)
        .map_err(|_| TransferError::corrupted(format!("transfer {id} has negative offset {offset}")))
}

fn record_from_row(row: &SqliteRow) -> Result<TransferRecord> {
    let id: String = row.try_get("transfer_id")?;

    let descriptor: TransferDescriptor =
        serde_json::from_str(&row.try_get::<String, _>("descriptor")?).map_err(|e| {
            TransferError::corrupted(format!("transfer {id} has an unreadable descriptor: {e}"))
        })?;

    let state = TransferState::from_str(&row.try_get::<String, _>("state")?)
        .map_err(|e| TransferError::corrupted(format!("transfer {id}: {e}")))?;

    let failure = match row.try_get::<Option<String>, _>("failure_kind")? {
        Some(kind) => {
            let kind = FailureKind::from_str(&kind)
                .map_err(|e| TransferError::corrupted(format!("transfer {id}: {e}")))?;
            let message: Option<String> = row.try_get("failure_message")?;
            Some(FailureCause::new(kind, message.unwrap_or_default()))
        },
        None => None,
    };

    let checkpoint = ChunkCheckpoint {
        transfer_id: TransferId::new(id.clone()),
        offset: from_db(row.try_get("byte_offset")?, &id)?,
        content_hash: row.try_get("content_hash")?,
        recorded_at: row.try_get("recorded_at")?,
    };

    Ok(TransferRecord {
        descriptor,
        state,
        checkpoint,
        failure,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TransferStore for SqliteTransferStore {
    #[instrument(skip_all, fields(transfer_id = %record.id()))]
    async fn insert(&self, record: &TransferRecord, endpoint: &EndpointReferenceEntry) -> Result<()> {
        let id = record.id().as_str();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO transfers (transfer_id, descriptor, state, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(transfer_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(serde_json::to_string(&record.descriptor)?)
        .bind(record.state.as_str())
        .bind(record.descriptor.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(TransferError::AlreadyExists(record.id().clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (transfer_id, byte_offset, content_hash, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(id)
        .bind(to_db(record.checkpoint.offset)?)
        .bind(record.checkpoint.content_hash.as_deref())
        .bind(record.checkpoint.recorded_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO endpoint_references (transfer_id, endpoint, credentials, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(id)
        .bind(&endpoint.endpoint)
        .bind(serde_json::to_string(&endpoint.credentials)?)
        .bind(endpoint.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Transfer admitted");
        Ok(())
    }

    async fn get(&self, id: &TransferId) -> Result<Option<TransferRecord>> {
        let row = sqlx::query(&format!("{SELECT_RECORD} WHERE t.transfer_id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!(
            "{SELECT_RECORD} WHERE t.state NOT IN ('completed', 'failed', 'abandoned') \
             ORDER BY t.created_at, t.transfer_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!("{SELECT_RECORD} ORDER BY t.created_at, t.transfer_id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self, failure), fields(transfer_id = %id))]
    async fn update_state(
        &self,
        id: &TransferId,
        state: TransferState,
        failure: Option<&FailureCause>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = ?1, failure_kind = ?2, failure_message = ?3, updated_at = ?4
            WHERE transfer_id = ?5
            "#,
        )
        .bind(state.as_str())
        .bind(failure.map(|f| f.kind.as_str()))
        .bind(failure.map(|f| f.message.as_str()))
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TransferError::NotFound(id.clone()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(transfer_id = %checkpoint.transfer_id, offset = checkpoint.offset))]
    async fn write_checkpoint(&self, checkpoint: &ChunkCheckpoint) -> Result<()> {
        let id = checkpoint.transfer_id.as_str();
        let offset = to_db(checkpoint.offset)?;
        let mut tx = self.pool.begin().await?;

        let advanced = sqlx::query(
            r#"
            UPDATE checkpoints
            SET byte_offset = ?1, content_hash = ?2, recorded_at = ?3
            WHERE transfer_id = ?4 AND byte_offset < ?1
            "#,
        )
        .bind(offset)
        .bind(checkpoint.content_hash.as_deref())
        .bind(checkpoint.recorded_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if advanced.rows_affected() == 0 {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT byte_offset FROM checkpoints WHERE transfer_id = ?1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;

            return Err(match current {
                Some(current) => TransferError::CheckpointRegression {
                    transfer_id: checkpoint.transfer_id.clone(),
                    current: from_db(current, id)?,
                    attempted: checkpoint.offset,
                },
                None => TransferError::NotFound(checkpoint.transfer_id.clone()),
            });
        }

        sqlx::query("UPDATE transfers SET updated_at = ?1 WHERE transfer_id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(transfer_id = %id))]
    async fn reset_checkpoint(&self, id: &TransferId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE checkpoints
            SET byte_offset = 0, content_hash = NULL, recorded_at = ?1
            WHERE transfer_id = ?2
            "#,
        )
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TransferError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn get_endpoint(&self, id: &TransferId) -> Result<Option<EndpointReferenceEntry>> {
        let row = sqlx::query(
            r#"
            SELECT endpoint, credentials, expires_at
            FROM endpoint_references WHERE transfer_id = ?1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let credentials: Credentials =
            serde_json::from_str(&row.try_get::<String, _>("credentials")?).map_err(|e| {
                TransferError::corrupted(format!("transfer {id} has unreadable credentials: {e}"))
            })?;
        let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at")?;

        Ok(Some(EndpointReferenceEntry {
            transfer_id: id.clone(),
            endpoint: row.try_get("endpoint")?,
            credentials,
            expires_at,
        }))
    }

    #[instrument(skip_all, fields(transfer_id = %entry.transfer_id))]
    async fn put_endpoint(&self, entry: &EndpointReferenceEntry) -> Result<()> {
        let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM transfers WHERE transfer_id = ?1")
            .bind(entry.transfer_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(TransferError::NotFound(entry.transfer_id.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO endpoint_references (transfer_id, endpoint, credentials, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(transfer_id) DO UPDATE SET
                endpoint = excluded.endpoint,
                credentials = excluded.credentials,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(entry.transfer_id.as_str())
        .bind(&entry.endpoint)
        .bind(serde_json::to_string(&entry.credentials)?)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_endpoint(&self, id: &TransferId) -> Result<()> {
        sqlx::query("DELETE FROM endpoint_references WHERE transfer_id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::descriptor::{EndpointReference, HttpSinkMode, SinkSpec, SourceSpec};
    use chrono::Duration;

    fn admission(id: &str) -> (TransferRecord, EndpointReferenceEntry) {
        let descriptor = TransferDescriptor::new(
            TransferId::new(id),
            SourceSpec::HttpStreaming {
                path: Some("exports/readings.csv".into()),
            },
            SinkSpec::Http {
                url: "http://lake/ingest".into(),
                mode: HttpSinkMode::Parts,
                auth_key: Some("lake".into()),
                part_name: None,
                resume_granularity: Some(1024),
            },
            EndpointReference {
                endpoint: "http://origin/data".into(),
                credentials: Credentials::Bearer {
                    token: "edr-token".into(),
                },
                expires_at: Some(Utc::now() + Duration::hours(1)),
            },
        );
        let entry = EndpointReferenceEntry::new(descriptor.transfer_id.clone(), &descriptor.endpoint);
        (TransferRecord::pending(&descriptor), entry)
    }

    async fn open(dir: &tempfile::TempDir) -> SqliteTransferStore {
        let url = format!("sqlite://{}", dir.path().join("transfers.db").display());
        SqliteTransferStore::connect(&url, 2).await.unwrap()
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, entry) = admission("t1");
        let id = rec.id().clone();

        {
            let store = open(&dir).await;
            store.insert(&rec, &entry).await.unwrap();
            store
                .update_state(&id, TransferState::Streaming, None)
                .await
                .unwrap();
            store
                .write_checkpoint(&ChunkCheckpoint::new(id.clone(), 2048, Some("ab".into())))
                .await
                .unwrap();
            store.close().await;
        }

        let store = open(&dir).await;
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TransferState::Streaming);
        assert_eq!(loaded.checkpoint.offset, 2048);
        assert_eq!(loaded.checkpoint.content_hash.as_deref(), Some("ab"));
        assert_eq!(loaded.descriptor, rec.descriptor);

        let endpoint = store.get_endpoint(&id).await.unwrap().unwrap();
        assert_eq!(endpoint.credentials, entry.credentials);
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_admission_and_regression() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let (rec, entry) = admission("t1");
        let id = rec.id().clone();

        store.insert(&rec, &entry).await.unwrap();
        assert!(matches!(
            store.insert(&rec, &entry).await.unwrap_err(),
            TransferError::AlreadyExists(_)
        ));

        store
            .write_checkpoint(&ChunkCheckpoint::new(id.clone(), 500, None))
            .await
            .unwrap();
        let err = store
            .write_checkpoint(&ChunkCheckpoint::new(id.clone(), 400, None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::CheckpointRegression {
                current: 500,
                attempted: 400,
                ..
            }
        ));
        assert!(err.is_fatal());

        let missing = ChunkCheckpoint::new(TransferId::new("ghost"), 1, None);
        assert!(matches!(
            store.write_checkpoint(&missing).await.unwrap_err(),
            TransferError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_failure_cause_and_endpoint_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let (rec, entry) = admission("t1");
        let id = rec.id().clone();
        store.insert(&rec, &entry).await.unwrap();

        let cause = FailureCause::new(FailureKind::SinkValidationFailed, "title must not be empty");
        store
            .update_state(&id, TransferState::Failed, Some(&cause))
            .await
            .unwrap();
        store.delete_endpoint(&id).await.unwrap();

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.failure, Some(cause));
        assert!(store.get_endpoint(&id).await.unwrap().is_none());
        assert!(store.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_gone_after_terminal_state() {
        use crate::notify::LogObserver;
        use crate::recovery::RecoveryManager;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let manager = RecoveryManager::new(Arc::new(store.clone()), Arc::new(LogObserver));

        let (rec, _) = admission("t1");
        let mut descriptor = rec.descriptor.clone();
        descriptor.endpoint.credentials = Credentials::Bearer {
            token: "SECRET-EDR-TOKEN".into(),
        };
        let id = manager.admit(descriptor).await.unwrap().id().clone();
        assert!(matches!(
            store.get_endpoint(&id).await.unwrap().unwrap().credentials,
            Credentials::Bearer { .. }
        ));

        manager
            .transition(&id, TransferState::Streaming)
            .await
            .unwrap();
        manager
            .fail(&id, FailureCause::new(FailureKind::SinkUnreachable, "down"))
            .await
            .unwrap();

        assert!(store.get_endpoint(&id).await.unwrap().is_none());
        let stored: String = sqlx::query_scalar("SELECT descriptor FROM transfers WHERE transfer_id = ?1")
            .bind(id.as_str())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(!stored.contains("SECRET-EDR-TOKEN"));
        assert!(stored.contains("http://origin/data"));
    }

    #[tokio::test]
    async fn test_corrupted_descriptor_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let (rec, entry) = admission("t1");
        store.insert(&rec, &entry).await.unwrap();

        sqlx::query("UPDATE transfers SET descriptor = '{' WHERE transfer_id = 't1'")
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.get(rec.id()).await.unwrap_err();
        assert!(matches!(err, TransferError::CorruptedState(_)));
        assert!(err.is_fatal());
    }
}
