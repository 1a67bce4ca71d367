use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::StorageError;

/// Markers for base-present files that were deleted in the delta layer.
///
/// Consulted during lexical merge so base hits for a deleted file are
/// suppressed. Cleared on compaction.
pub struct TombstoneManager {
    conn: Arc<Mutex<Connection>>,
}

impl TombstoneManager {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self, StorageError> {
        {
            let guard = conn.lock().expect("delta db lock poisoned");
            guard.execute_batch(
                "CREATE TABLE IF NOT EXISTS tombstones (
                     repo_id TEXT NOT NULL,
                     file_path TEXT NOT NULL,
                     base_version_id INTEGER,
                     deleted_at INTEGER NOT NULL,
                     PRIMARY KEY (repo_id, file_path)
                 );",
            )?;
        }
        Ok(Self { conn })
    }

    /// Record a tombstone for a deleted file.
    pub fn record(
        &self,
        repo_id: &str,
        file_path: &str,
        base_version_id: Option<i64>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        conn.execute(
            "INSERT INTO tombstones (repo_id, file_path, base_version_id, deleted_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repo_id, file_path)
             DO UPDATE SET base_version_id = ?3, deleted_at = ?4",
            params![repo_id, file_path, base_version_id, crate::epoch_secs()],
        )?;
        Ok(())
    }

    /// Remove the tombstone for one path, if any.
    pub fn remove(&self, repo_id: &str, file_path: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        conn.execute(
            "DELETE FROM tombstones WHERE repo_id = ?1 AND file_path = ?2",
            params![repo_id, file_path],
        )?;
        Ok(())
    }

    /// All tombstoned paths for a repo.
    pub fn paths_for_repo(&self, repo_id: &str) -> Result<HashSet<String>, StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        let mut stmt =
            conn.prepare_cached("SELECT file_path FROM tombstones WHERE repo_id = ?1")?;
        let mut rows = stmt.query(params![repo_id])?;
        let mut paths = HashSet::new();
        while let Some(row) = rows.next()? {
            paths.insert(row.get(0)?);
        }
        Ok(paths)
    }

    /// Drop all tombstones for a repo (compaction promote).
    pub fn clear(&self, repo_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        conn.execute("DELETE FROM tombstones WHERE repo_id = ?1", params![repo_id])?;
        Ok(())
    }
}
