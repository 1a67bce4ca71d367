use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::StorageError;
use crate::tombstone::TombstoneManager;

/// A single hit from the delta lexical index.
#[derive(Debug, Clone)]
pub struct DeltaHit {
    pub file_path: String,
    pub score: f32,
    pub snippet: String,
}

/// Open (or create) the delta-layer SQLite database shared by the delta
/// index, tombstones, and the freeze buffer.
pub fn open_delta_db(path: &Path) -> Result<Arc<Mutex<Connection>>, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory variant for testing.
pub fn open_delta_db_in_memory() -> Result<Arc<Mutex<Connection>>, StorageError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub(crate) fn configure_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Per-file incremental full-text store for uncommitted or not-yet-compacted
/// content, backed by SQLite FTS5.
///
/// Rows are keyed `(repo_id, file_path)` with a soft-delete flag. The base
/// lexical index is never touched here; compaction consolidates delta content
/// into the base and clears these rows.
pub struct DeltaLexicalStore {
    conn: Arc<Mutex<Connection>>,
    tombstones: TombstoneManager,
}

impl DeltaLexicalStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self, StorageError> {
        {
            let guard = conn.lock().expect("delta db lock poisoned");
            guard.execute_batch(
                "CREATE TABLE IF NOT EXISTS delta_files (
                     repo_id TEXT NOT NULL,
                     file_path TEXT NOT NULL,
                     base_version_id INTEGER,
                     deleted INTEGER NOT NULL DEFAULT 0,
                     last_updated INTEGER NOT NULL,
                     PRIMARY KEY (repo_id, file_path)
                 );
                 CREATE VIRTUAL TABLE IF NOT EXISTS delta_fts
                     USING fts5(repo_id UNINDEXED, file_path UNINDEXED, content);",
            )?;
        }
        let tombstones = TombstoneManager::new(conn.clone())?;
        Ok(Self { conn, tombstones })
    }

    /// The tombstone manager sharing this store's database.
    pub fn tombstones(&self) -> &TombstoneManager {
        &self.tombstones
    }

    /// Upsert one file into the delta. Clears any tombstone for the path.
    pub fn index_file(
        &self,
        repo_id: &str,
        file_path: &str,
        content: &str,
        base_version_id: Option<i64>,
    ) -> Result<(), StorageError> {
        let now = crate::epoch_secs();
        {
            let conn = self.conn.lock().expect("delta db lock poisoned");
            conn.execute(
                "INSERT INTO delta_files (repo_id, file_path, base_version_id, deleted, last_updated)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(repo_id, file_path)
                 DO UPDATE SET base_version_id = ?3, deleted = 0, last_updated = ?4",
                params![repo_id, file_path, base_version_id, now],
            )?;
            conn.execute(
                "DELETE FROM delta_fts WHERE repo_id = ?1 AND file_path = ?2",
                params![repo_id, file_path],
            )?;
            conn.execute(
                "INSERT INTO delta_fts (repo_id, file_path, content) VALUES (?1, ?2, ?3)",
                params![repo_id, file_path, content],
            )?;
        }
        self.tombstones.remove(repo_id, file_path)?;
        tracing::debug!(repo_id, file_path, "delta file indexed");
        Ok(())
    }

    /// Mark one file deleted: records a tombstone and drops the index row.
    pub fn delete_file(
        &self,
        repo_id: &str,
        file_path: &str,
        base_version_id: Option<i64>,
    ) -> Result<(), StorageError> {
        let now = crate::epoch_secs();
        {
            let conn = self.conn.lock().expect("delta db lock poisoned");
            conn.execute(
                "INSERT INTO delta_files (repo_id, file_path, base_version_id, deleted, last_updated)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(repo_id, file_path)
                 DO UPDATE SET base_version_id = ?3, deleted = 1, last_updated = ?4",
                params![repo_id, file_path, base_version_id, now],
            )?;
            conn.execute(
                "DELETE FROM delta_fts WHERE repo_id = ?1 AND file_path = ?2",
                params![repo_id, file_path],
            )?;
        }
        self.tombstones.record(repo_id, file_path, base_version_id)?;
        tracing::debug!(repo_id, file_path, "delta file tombstoned");
        Ok(())
    }

    /// Full-text match over the delta. Scores are BM25 (higher = better).
    pub fn search(
        &self,
        repo_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<DeltaHit>, StorageError> {
        let match_expr = match fts_match_expr(query) {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        let conn = self.conn.lock().expect("delta db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT file_path, -bm25(delta_fts), snippet(delta_fts, 2, '', '', '…', 12)
             FROM delta_fts
             WHERE delta_fts MATCH ?1 AND repo_id = ?2
             ORDER BY bm25(delta_fts)
             LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![match_expr, repo_id, limit as i64])?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            hits.push(DeltaHit {
                file_path: row.get(0)?,
                score: row.get::<_, f64>(1)? as f32,
                snippet: row.get(2)?,
            });
        }
        Ok(hits)
    }

    /// Number of live (non-deleted) delta rows for a repo.
    pub fn count(&self, repo_id: &str) -> Result<usize, StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM delta_files WHERE repo_id = ?1 AND deleted = 0",
            params![repo_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Seconds since the most recent delta write for a repo, or `None` when
    /// the delta is empty.
    pub fn age_secs(&self, repo_id: &str) -> Result<Option<u64>, StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        let last: Option<i64> = conn.query_row(
            "SELECT MAX(last_updated) FROM delta_files WHERE repo_id = ?1 AND deleted = 0",
            params![repo_id],
            |row| row.get(0),
        )?;
        Ok(last.map(|t| (crate::epoch_secs() - t).max(0) as u64))
    }

    /// Drop all delta rows for a repo (used after compaction promotes).
    pub fn clear(&self, repo_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        conn.execute("DELETE FROM delta_files WHERE repo_id = ?1", params![repo_id])?;
        conn.execute("DELETE FROM delta_fts WHERE repo_id = ?1", params![repo_id])?;
        tracing::info!(repo_id, "delta cleared");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_updated(&self, repo_id: &str, secs_ago: i64) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE delta_files SET last_updated = ?1 WHERE repo_id = ?2",
            params![crate::epoch_secs() - secs_ago, repo_id],
        )
        .unwrap();
    }
}

/// Build a safe FTS5 MATCH expression from free-form query text.
///
/// FTS5 has its own query syntax; raw user text with quotes, colons, or
/// operators would error. Alphanumeric tokens are extracted, quoted, and
/// OR-joined instead.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}
