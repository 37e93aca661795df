//! SQLite-backed storage adapter

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::RwLock;
use tracing::{debug, info};

use remora_proto::{MutationEvent, MutationType, Record, SyncMetadata};

use crate::adapter::StorageAdapter;
use crate::errors::{Result, StoreError};

/// Synchronous SQLite store. Callers go through [`AsyncSqliteStore`].
struct SqliteStore {
    conn: Connection,
}

// SQLite connections can be shared across threads as long as access is
// serialized, which the async wrapper's lock guarantees.
unsafe impl Send for SqliteStore {}
unsafe impl Sync for SqliteStore {}

impl SqliteStore {
    fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.initialize()?;
        Ok(store)
    }

    fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Record rows, one per (model, id)
            CREATE TABLE IF NOT EXISTS records (
                model_name TEXT NOT NULL,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (model_name, id)
            );

            -- Server version metadata, one row per record id
            CREATE TABLE IF NOT EXISTS sync_metadata (
                id TEXT PRIMARY KEY,
                model_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                last_changed_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );

            -- Outbox of local mutations awaiting upload
            CREATE TABLE IF NOT EXISTS mutation_queue (
                id TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                model_name TEXT NOT NULL,
                json TEXT NOT NULL,
                mutation_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                in_process INTEGER NOT NULL DEFAULT 0,
                version INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_mutation_queue_order
                ON mutation_queue(created_at ASC);
            CREATE INDEX IF NOT EXISTS idx_mutation_queue_model
                ON mutation_queue(model_id);
            "#,
        )?;

        info!("sqlite store initialized");
        Ok(())
    }

    fn save_record(&self, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        self.conn.execute(
            r#"
            INSERT INTO records (model_name, id, payload)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(model_name, id) DO UPDATE SET payload = excluded.payload
            "#,
            params![record.model_name, record.id, payload],
        )?;
        Ok(())
    }

    fn get_record(&self, model_name: &str, id: &str) -> Result<Option<Record>> {
        let row = self
            .conn
            .query_row(
                "SELECT payload FROM records WHERE model_name = ?1 AND id = ?2",
                params![model_name, id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match row {
            Some(payload) => Ok(Some(Record::new(id, model_name, serde_json::from_str(&payload)?))),
            None => Ok(None),
        }
    }

    fn delete_record(&self, model_name: &str, id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM records WHERE model_name = ?1 AND id = ?2",
            params![model_name, id],
        )?;
        Ok(())
    }

    fn query_records(&self, model_name: &str) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, payload FROM records WHERE model_name = ?1 ORDER BY id")?;

        let rows = stmt.query_map(params![model_name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            records.push(Record::new(id, model_name, serde_json::from_str(&payload)?));
        }
        Ok(records)
    }

    fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_metadata (id, model_name, version, last_changed_at, deleted)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                model_name = excluded.model_name,
                version = excluded.version,
                last_changed_at = excluded.last_changed_at,
                deleted = excluded.deleted
            "#,
            params![
                metadata.id,
                metadata.model_name,
                metadata.version as i64,
                metadata.last_changed_at,
                metadata.deleted,
            ],
        )?;
        Ok(())
    }

    fn get_metadata(&self, id: &str) -> Result<Option<SyncMetadata>> {
        let metadata = self
            .conn
            .query_row(
                r#"
                SELECT id, model_name, version, last_changed_at, deleted
                FROM sync_metadata WHERE id = ?1
                "#,
                params![id],
                |row| {
                    Ok(SyncMetadata {
                        id: row.get(0)?,
                        model_name: row.get(1)?,
                        version: row.get::<_, i64>(2)? as u64,
                        last_changed_at: row.get(3)?,
                        deleted: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(metadata)
    }

    fn enqueue_mutation(&self, event: &MutationEvent) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO mutation_queue
                (id, model_id, model_name, json, mutation_type, created_at, in_process, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                json = excluded.json,
                mutation_type = excluded.mutation_type,
                in_process = excluded.in_process,
                version = excluded.version
            "#,
            params![
                event.id,
                event.model_id,
                event.model_name,
                event.json,
                event.mutation_type.as_str(),
                event.created_at,
                event.in_process,
                event.version.map(|v| v as i64),
            ],
        )?;
        debug!(id = %event.id, model_id = %event.model_id, "mutation enqueued");
        Ok(())
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<(MutationEvent, String)> {
        let mutation_type: String = row.get(4)?;
        Ok((
            MutationEvent {
                id: row.get(0)?,
                model_id: row.get(1)?,
                model_name: row.get(2)?,
                json: row.get(3)?,
                // patched up by the caller once the tag is validated
                mutation_type: MutationType::Create,
                created_at: row.get(5)?,
                in_process: row.get(6)?,
                version: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
            },
            mutation_type,
        ))
    }

    fn decode_event(pair: (MutationEvent, String)) -> Result<MutationEvent> {
        let (mut event, tag) = pair;
        event.mutation_type = MutationType::parse(&tag)
            .ok_or_else(|| StoreError::UnknownMutationType(tag.clone()))?;
        Ok(event)
    }

    fn head_mutation(&self) -> Result<Option<MutationEvent>> {
        let pair = self
            .conn
            .query_row(
                r#"
                SELECT id, model_id, model_name, json, mutation_type,
                       created_at, in_process, version
                FROM mutation_queue
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
                "#,
                [],
                Self::row_to_event,
            )
            .optional()?;
        pair.map(Self::decode_event).transpose()
    }

    fn pending_mutation(&self, model_id: &str) -> Result<Option<MutationEvent>> {
        let pair = self
            .conn
            .query_row(
                r#"
                SELECT id, model_id, model_name, json, mutation_type,
                       created_at, in_process, version
                FROM mutation_queue
                WHERE model_id = ?1
                ORDER BY created_at DESC, rowid DESC
                LIMIT 1
                "#,
                params![model_id],
                Self::row_to_event,
            )
            .optional()?;
        pair.map(Self::decode_event).transpose()
    }

    fn mark_in_process(&self, id: &str, in_process: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE mutation_queue SET in_process = ?2 WHERE id = ?1",
            params![id, in_process],
        )?;
        Ok(())
    }

    fn delete_mutation(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM mutation_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn clear_in_process(&self) -> Result<()> {
        let cleared = self
            .conn
            .execute("UPDATE mutation_queue SET in_process = 0 WHERE in_process = 1", [])?;
        if cleared > 0 {
            info!(cleared, "reset in-process mutations from a previous run");
        }
        Ok(())
    }
}

/// Async facade over the SQLite store, shareable across tasks.
#[derive(Clone)]
pub struct AsyncSqliteStore {
    inner: Arc<RwLock<SqliteStore>>,
}

impl AsyncSqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(RwLock::new(SqliteStore::open(path)?)),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(RwLock::new(SqliteStore::open_in_memory()?)),
        })
    }
}

#[async_trait]
impl StorageAdapter for AsyncSqliteStore {
    async fn save_record(&self, record: &Record) -> Result<()> {
        self.inner.write().await.save_record(record)
    }

    async fn get_record(&self, model_name: &str, id: &str) -> Result<Option<Record>> {
        self.inner.read().await.get_record(model_name, id)
    }

    async fn delete_record(&self, model_name: &str, id: &str) -> Result<()> {
        self.inner.write().await.delete_record(model_name, id)
    }

    async fn query_records(&self, model_name: &str) -> Result<Vec<Record>> {
        self.inner.read().await.query_records(model_name)
    }

    async fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        self.inner.write().await.save_metadata(metadata)
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<SyncMetadata>> {
        self.inner.read().await.get_metadata(id)
    }

    async fn enqueue_mutation(&self, event: &MutationEvent) -> Result<()> {
        self.inner.write().await.enqueue_mutation(event)
    }

    async fn head_mutation(&self) -> Result<Option<MutationEvent>> {
        self.inner.read().await.head_mutation()
    }

    async fn pending_mutation(&self, model_id: &str) -> Result<Option<MutationEvent>> {
        self.inner.read().await.pending_mutation(model_id)
    }

    async fn mark_in_process(&self, id: &str, in_process: bool) -> Result<()> {
        self.inner.write().await.mark_in_process(id, in_process)
    }

    async fn delete_mutation(&self, id: &str) -> Result<()> {
        self.inner.write().await.delete_mutation(id)
    }

    async fn clear_in_process(&self) -> Result<()> {
        self.inner.write().await.clear_in_process()
    }
}
