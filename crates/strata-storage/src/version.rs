use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Lifecycle status of an index version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexVersionStatus {
    Indexing,
    Completed,
    Failed,
}

impl IndexVersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Indexing => "indexing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "indexing" => Some(Self::Indexing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One committed (or in-flight) base index build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexVersion {
    pub repo_id: String,
    /// Globally monotone, sequence-generated.
    pub version_id: i64,
    pub git_commit: String,
    /// Unix epoch seconds.
    pub indexed_at: i64,
    pub file_count: u32,
    pub status: IndexVersionStatus,
    pub duration_ms: f64,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl IndexVersion {
    pub fn is_completed(&self) -> bool {
        self.status == IndexVersionStatus::Completed
    }

    /// Seconds elapsed since this version was created.
    pub fn age_secs(&self) -> i64 {
        (crate::epoch_secs() - self.indexed_at).max(0)
    }
}

/// SQLite-backed persistence for index versions.
///
/// Only `Completed` versions are returned by `get_latest_version`, so
/// queries never see an in-flight or failed build by default.
pub struct IndexVersionStore {
    conn: Arc<Mutex<Connection>>,
}

impl IndexVersionStore {
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
            "CREATE TABLE IF NOT EXISTS index_versions (
                 version_id INTEGER PRIMARY KEY AUTOINCREMENT,
                 repo_id TEXT NOT NULL,
                 git_commit TEXT NOT NULL,
                 indexed_at INTEGER NOT NULL,
                 file_count INTEGER NOT NULL DEFAULT 0,
                 status TEXT NOT NULL,
                 duration_ms REAL NOT NULL DEFAULT 0,
                 error_message TEXT,
                 metadata TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_versions_repo
                 ON index_versions (repo_id, version_id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new version in `Indexing` status.
    pub fn create_version(
        &self,
        repo_id: &str,
        git_commit: &str,
        file_count: u32,
    ) -> Result<IndexVersion, StorageError> {
        let now = crate::epoch_secs();
        let conn = self.conn.lock().expect("version db lock poisoned");
        conn.execute(
            "INSERT INTO index_versions (repo_id, git_commit, indexed_at, file_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                repo_id,
                git_commit,
                now,
                file_count,
                IndexVersionStatus::Indexing.as_str()
            ],
        )?;
        let version_id = conn.last_insert_rowid();
        tracing::info!(repo_id, version_id, git_commit, "index version created");
        Ok(IndexVersion {
            repo_id: repo_id.to_string(),
            version_id,
            git_commit: git_commit.to_string(),
            indexed_at: now,
            file_count,
            status: IndexVersionStatus::Indexing,
            duration_ms: 0.0,
            error_message: None,
            metadata: None,
        })
    }

    /// Mark a version completed.
    pub fn complete_version(
        &self,
        repo_id: &str,
        version_id: i64,
        duration_ms: f64,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StorageError> {
        let meta_json = metadata
            .map(|m| serde_json::to_string(&m))
            .transpose()?;
        let conn = self.conn.lock().expect("version db lock poisoned");
        conn.execute(
            "UPDATE index_versions SET status = ?1, duration_ms = ?2, metadata = ?3
             WHERE repo_id = ?4 AND version_id = ?5",
            params![
                IndexVersionStatus::Completed.as_str(),
                duration_ms,
                meta_json,
                repo_id,
                version_id
            ],
        )?;
        tracing::info!(repo_id, version_id, duration_ms, "index version completed");
        Ok(())
    }

    /// Mark a version failed.
    pub fn fail_version(
        &self,
        repo_id: &str,
        version_id: i64,
        error_message: &str,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("version db lock poisoned");
        conn.execute(
            "UPDATE index_versions SET status = ?1, error_message = ?2
             WHERE repo_id = ?3 AND version_id = ?4",
            params![
                IndexVersionStatus::Failed.as_str(),
                error_message,
                repo_id,
                version_id
            ],
        )?;
        tracing::error!(repo_id, version_id, error = error_message, "index version failed");
        Ok(())
    }

    /// Latest `Completed` version for a repo.
    pub fn get_latest_version(&self, repo_id: &str) -> Result<Option<IndexVersion>, StorageError> {
        let conn = self.conn.lock().expect("version db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT version_id, repo_id, git_commit, indexed_at, file_count, status,
                    duration_ms, error_message, metadata
             FROM index_versions
             WHERE repo_id = ?1 AND status = ?2
             ORDER BY version_id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![repo_id, IndexVersionStatus::Completed.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_version(row)?)),
            None => Ok(None),
        }
    }

    /// A specific version, regardless of status.
    pub fn get_version(
        &self,
        repo_id: &str,
        version_id: i64,
    ) -> Result<Option<IndexVersion>, StorageError> {
        let conn = self.conn.lock().expect("version db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT version_id, repo_id, git_commit, indexed_at, file_count, status,
                    duration_ms, error_message, metadata
             FROM index_versions WHERE repo_id = ?1 AND version_id = ?2",
        )?;
        let mut rows = stmt.query(params![repo_id, version_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_version(row)?)),
            None => Ok(None),
        }
    }

    /// Newest version for a git commit.
    pub fn get_version_by_commit(
        &self,
        repo_id: &str,
        git_commit: &str,
    ) -> Result<Option<IndexVersion>, StorageError> {
        let conn = self.conn.lock().expect("version db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT version_id, repo_id, git_commit, indexed_at, file_count, status,
                    duration_ms, error_message, metadata
             FROM index_versions
             WHERE repo_id = ?1 AND git_commit = ?2
             ORDER BY version_id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![repo_id, git_commit])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_version(row)?)),
            None => Ok(None),
        }
    }

    /// Recent versions, newest first, optionally filtered by status.
    pub fn list_versions(
        &self,
        repo_id: &str,
        limit: usize,
        status: Option<IndexVersionStatus>,
    ) -> Result<Vec<IndexVersion>, StorageError> {
        let conn = self.conn.lock().expect("version db lock poisoned");
        let mut versions = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT version_id, repo_id, git_commit, indexed_at, file_count, status,
                            duration_ms, error_message, metadata
                     FROM index_versions
                     WHERE repo_id = ?1 AND status = ?2
                     ORDER BY version_id DESC LIMIT ?3",
                )?;
                let mut rows = stmt.query(params![repo_id, s.as_str(), limit as i64])?;
                while let Some(row) = rows.next()? {
                    versions.push(row_to_version(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT version_id, repo_id, git_commit, indexed_at, file_count, status,
                            duration_ms, error_message, metadata
                     FROM index_versions
                     WHERE repo_id = ?1
                     ORDER BY version_id DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![repo_id, limit as i64])?;
                while let Some(row) = rows.next()? {
                    versions.push(row_to_version(row)?);
                }
            }
        }
        Ok(versions)
    }

    /// Delete old versions, keeping the latest `keep_count`. Returns the
    /// number of deleted rows.
    pub fn cleanup_old_versions(
        &self,
        repo_id: &str,
        keep_count: usize,
    ) -> Result<usize, StorageError> {
        let conn = self.conn.lock().expect("version db lock poisoned");
        let deleted = conn.execute(
            "DELETE FROM index_versions
             WHERE repo_id = ?1 AND version_id NOT IN (
                 SELECT version_id FROM index_versions
                 WHERE repo_id = ?1
                 ORDER BY version_id DESC LIMIT ?2
             )",
            params![repo_id, keep_count as i64],
        )?;
        tracing::info!(repo_id, deleted, "index versions cleaned up");
        Ok(deleted)
    }
}

fn row_to_version(row: &rusqlite::Row<'_>) -> Result<IndexVersion, StorageError> {
    let status_str: String = row.get(5)?;
    let metadata: Option<String> = row.get(8)?;
    Ok(IndexVersion {
        version_id: row.get(0)?,
        repo_id: row.get(1)?,
        git_commit: row.get(2)?,
        indexed_at: row.get(3)?,
        file_count: row.get::<_, i64>(4)? as u32,
        status: IndexVersionStatus::parse(&status_str).unwrap_or(IndexVersionStatus::Failed),
        duration_ms: row.get(6)?,
        error_message: row.get(7)?,
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
    })
}
