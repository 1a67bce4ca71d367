use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::StorageError;

/// Records of files already indexed at a given head SHA.
///
/// `index_files` consults this so a second save-hook call with the same
/// `(repo, snapshot, path, head_sha)` is a no-op.
pub struct IdempotencyStore {
    conn: Arc<Mutex<Connection>>,
}

impl IdempotencyStore {
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
            "CREATE TABLE IF NOT EXISTS indexed_files (
                 repo_id TEXT NOT NULL,
                 snapshot_id TEXT NOT NULL,
                 file_path TEXT NOT NULL,
                 head_sha TEXT NOT NULL,
                 indexed_at INTEGER NOT NULL,
                 PRIMARY KEY (repo_id, snapshot_id, file_path, head_sha)
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record a successfully indexed file.
    pub fn mark_indexed(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        file_path: &str,
        head_sha: &str,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("idempotency db lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO indexed_files
             (repo_id, snapshot_id, file_path, head_sha, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![repo_id, snapshot_id, file_path, head_sha, crate::epoch_secs()],
        )?;
        Ok(())
    }

    /// Split `file_paths` into (needs_indexing, already_indexed) for the
    /// given head SHA, preserving input order.
    pub fn filter_already_indexed(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        file_paths: &[String],
        head_sha: &str,
    ) -> Result<(Vec<String>, Vec<String>), StorageError> {
        let conn = self.conn.lock().expect("idempotency db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM indexed_files
             WHERE repo_id = ?1 AND snapshot_id = ?2 AND file_path = ?3 AND head_sha = ?4",
        )?;
        let mut needs = Vec::new();
        let mut already = Vec::new();
        for path in file_paths {
            let seen = stmt.exists(params![repo_id, snapshot_id, path, head_sha])?;
            if seen {
                already.push(path.clone());
            } else {
                needs.push(path.clone());
            }
        }
        Ok((needs, already))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_pass_filters_everything() {
        let store = IdempotencyStore::open_in_memory().unwrap();
        let paths = vec!["a.py".to_string(), "b.py".to_string()];

        let (needs, already) = store
            .filter_already_indexed("r1", "s1", &paths, "sha1")
            .unwrap();
        assert_eq!(needs.len(), 2);
        assert!(already.is_empty());

        for p in &paths {
            store.mark_indexed("r1", "s1", p, "sha1").unwrap();
        }

        let (needs, already) = store
            .filter_already_indexed("r1", "s1", &paths, "sha1")
            .unwrap();
        assert!(needs.is_empty());
        assert_eq!(already.len(), 2);
    }

    #[test]
    fn new_sha_reindexes() {
        let store = IdempotencyStore::open_in_memory().unwrap();
        store.mark_indexed("r1", "s1", "a.py", "sha1").unwrap();

        let (needs, _) = store
            .filter_already_indexed("r1", "s1", &["a.py".to_string()], "sha2")
            .unwrap();
        assert_eq!(needs, vec!["a.py".to_string()]);
    }

    #[test]
    fn scoped_by_snapshot() {
        let store = IdempotencyStore::open_in_memory().unwrap();
        store.mark_indexed("r1", "s1", "a.py", "sha1").unwrap();

        let (needs, _) = store
            .filter_already_indexed("r1", "s2", &["a.py".to_string()], "sha1")
            .unwrap();
        assert_eq!(needs.len(), 1);
    }
}
