use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use strata_core::ChunkId;

use crate::error::StorageError;

/// One row popped from the embedding queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub row_id: i64,
    pub repo_id: String,
    pub snapshot_id: String,
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub symbol_id: Option<String>,
    /// Text to embed.
    pub content: String,
    pub priority: i32,
    pub attempts: u32,
}

/// Durable priority queue of chunks awaiting embedding.
///
/// Rows are keyed `(repo_id, snapshot_id, chunk_id)`; re-enqueueing an
/// existing key refreshes its content, keeps the higher priority, and resets
/// its attempt counter. Pop order is highest priority first, then FIFO.
pub struct EmbeddingQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl EmbeddingQueueStore {
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        crate::delta::configure_pragmas(&conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS embedding_queue (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 repo_id TEXT NOT NULL,
                 snapshot_id TEXT NOT NULL,
                 chunk_id BLOB NOT NULL,
                 file_path TEXT NOT NULL,
                 symbol_id TEXT,
                 content TEXT NOT NULL,
                 priority INTEGER NOT NULL DEFAULT 0,
                 attempts INTEGER NOT NULL DEFAULT 0,
                 status TEXT NOT NULL DEFAULT 'pending',
                 enqueued_at INTEGER NOT NULL,
                 UNIQUE (repo_id, snapshot_id, chunk_id)
             );
             CREATE INDEX IF NOT EXISTS idx_queue_pop
                 ON embedding_queue (status, priority, id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert one queue row. Returns true when a new row was created.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        chunk_id: ChunkId,
        file_path: &str,
        symbol_id: Option<&str>,
        content: &str,
        priority: i32,
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock().expect("queue db lock poisoned");
        let existed: bool = conn
            .prepare_cached(
                "SELECT 1 FROM embedding_queue
                 WHERE repo_id = ?1 AND snapshot_id = ?2 AND chunk_id = ?3",
            )?
            .exists(params![repo_id, snapshot_id, chunk_id.as_bytes().as_slice()])?;
        conn.execute(
            "INSERT INTO embedding_queue
             (repo_id, snapshot_id, chunk_id, file_path, symbol_id, content,
              priority, attempts, status, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'pending', ?8)
             ON CONFLICT(repo_id, snapshot_id, chunk_id) DO UPDATE SET
                 file_path = excluded.file_path,
                 symbol_id = excluded.symbol_id,
                 content = excluded.content,
                 priority = MAX(priority, excluded.priority),
                 attempts = 0,
                 status = 'pending'",
            params![
                repo_id,
                snapshot_id,
                chunk_id.as_bytes().as_slice(),
                file_path,
                symbol_id,
                content,
                priority,
                crate::epoch_secs(),
            ],
        )?;
        Ok(!existed)
    }

    /// Pop the highest-priority pending row (FIFO within a priority level)
    /// and mark it processing.
    pub fn pop_one(&self) -> Result<Option<QueueItem>, StorageError> {
        let conn = self.conn.lock().expect("queue db lock poisoned");
        let item = {
            let mut stmt = conn.prepare_cached(
                "SELECT id, repo_id, snapshot_id, chunk_id, file_path, symbol_id,
                        content, priority, attempts
                 FROM embedding_queue
                 WHERE status = 'pending'
                 ORDER BY priority DESC, id ASC
                 LIMIT 1",
            )?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => {
                    let raw: Vec<u8> = row.get(3)?;
                    let bytes: [u8; 16] = raw.try_into().map_err(|_| {
                        StorageError::VectorIndexUnavailable {
                            reason: "malformed chunk_id in queue row".to_string(),
                        }
                    })?;
                    Some(QueueItem {
                        row_id: row.get(0)?,
                        repo_id: row.get(1)?,
                        snapshot_id: row.get(2)?,
                        chunk_id: ChunkId::from_bytes(bytes),
                        file_path: row.get(4)?,
                        symbol_id: row.get(5)?,
                        content: row.get(6)?,
                        priority: row.get(7)?,
                        attempts: row.get::<_, i64>(8)? as u32,
                    })
                }
                None => None,
            }
        };
        if let Some(ref item) = item {
            conn.execute(
                "UPDATE embedding_queue SET status = 'processing' WHERE id = ?1",
                params![item.row_id],
            )?;
        }
        Ok(item)
    }

    /// Remove a completed row.
    pub fn mark_done(&self, row_id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("queue db lock poisoned");
        conn.execute("DELETE FROM embedding_queue WHERE id = ?1", params![row_id])?;
        Ok(())
    }

    /// Put a failed row back in line, bumping its attempt counter. The
    /// original priority is kept.
    pub fn requeue(&self, row_id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("queue db lock poisoned");
        conn.execute(
            "UPDATE embedding_queue SET status = 'pending', attempts = attempts + 1
             WHERE id = ?1",
            params![row_id],
        )?;
        Ok(())
    }

    /// Mark a row failed permanently (retries exhausted).
    pub fn mark_failed(&self, row_id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("queue db lock poisoned");
        conn.execute(
            "UPDATE embedding_queue SET status = 'failed' WHERE id = ?1",
            params![row_id],
        )?;
        Ok(())
    }

    /// Number of pending rows across all repos.
    pub fn pending_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock().expect("queue db lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embedding_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Whether no pending or in-flight rows remain for a (repo, snapshot).
    pub fn is_idle(&self, repo_id: &str, snapshot_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().expect("queue db lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embedding_queue
             WHERE repo_id = ?1 AND snapshot_id = ?2 AND status IN ('pending', 'processing')",
            params![repo_id, snapshot_id],
            |row| row.get(0),
        )?;
        Ok(count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(store: &EmbeddingQueueStore, id: u128, priority: i32) {
        store
            .enqueue("r1", "s1", ChunkId(id), "a.py", None, "text", priority)
            .unwrap();
    }

    #[test]
    fn pop_order_priority_then_fifo() {
        let store = EmbeddingQueueStore::open_in_memory().unwrap();
        enqueue(&store, 1, 0);
        enqueue(&store, 2, 5);
        enqueue(&store, 3, 5);

        assert_eq!(store.pop_one().unwrap().unwrap().chunk_id, ChunkId(2));
        assert_eq!(store.pop_one().unwrap().unwrap().chunk_id, ChunkId(3));
        assert_eq!(store.pop_one().unwrap().unwrap().chunk_id, ChunkId(1));
        assert!(store.pop_one().unwrap().is_none());
    }

    #[test]
    fn enqueue_upsert_keeps_higher_priority() {
        let store = EmbeddingQueueStore::open_in_memory().unwrap();
        assert!(store.enqueue("r1", "s1", ChunkId(1), "a.py", None, "v1", 3).unwrap());
        assert!(!store.enqueue("r1", "s1", ChunkId(1), "a.py", None, "v2", 0).unwrap());

        let item = store.pop_one().unwrap().unwrap();
        assert_eq!(item.priority, 3);
        assert_eq!(item.content, "v2");
        assert_eq!(item.attempts, 0);
    }

    #[test]
    fn requeue_bumps_attempts_same_priority() {
        let store = EmbeddingQueueStore::open_in_memory().unwrap();
        enqueue(&store, 1, 2);
        let item = store.pop_one().unwrap().unwrap();
        store.requeue(item.row_id).unwrap();

        let again = store.pop_one().unwrap().unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(again.priority, 2);
    }

    #[test]
    fn done_and_failed_leave_queue_idle() {
        let store = EmbeddingQueueStore::open_in_memory().unwrap();
        enqueue(&store, 1, 0);
        enqueue(&store, 2, 0);
        assert!(!store.is_idle("r1", "s1").unwrap());

        let a = store.pop_one().unwrap().unwrap();
        store.mark_done(a.row_id).unwrap();
        let b = store.pop_one().unwrap().unwrap();
        store.mark_failed(b.row_id).unwrap();

        assert!(store.is_idle("r1", "s1").unwrap());
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn processing_rows_are_not_popped_twice() {
        let store = EmbeddingQueueStore::open_in_memory().unwrap();
        enqueue(&store, 1, 0);
        assert!(store.pop_one().unwrap().is_some());
        assert!(store.pop_one().unwrap().is_none());
    }
}
