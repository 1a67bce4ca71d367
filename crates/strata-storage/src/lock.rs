use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::StorageError;

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique opaque lock token.
fn new_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:032x}", xxh3_128(format!("{nanos}:{counter}").as_bytes()))
}

/// Repo-scoped locks following the single-instance lock protocol:
/// token-guarded acquire, release that compares the holder's token, and TTL
/// extension via the same token.
///
/// Compaction serializes on these so at most one compaction runs per repo.
pub struct RepoLockStore {
    conn: Arc<Mutex<Connection>>,
    ttl_secs: i64,
}

impl RepoLockStore {
    pub fn open(db_path: &Path, ttl_secs: u64) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn, ttl_secs)
    }

    pub fn open_in_memory(ttl_secs: u64) -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?, ttl_secs)
    }

    fn init(conn: Connection, ttl_secs: u64) -> Result<Self, StorageError> {
        crate::delta::configure_pragmas(&conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS repo_locks (
                 lock_key TEXT PRIMARY KEY,
                 token TEXT NOT NULL,
                 expires_at INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl_secs: ttl_secs as i64,
        })
    }

    /// Try to acquire the lock. Returns the holder token on success, `None`
    /// when another holder's unexpired token is present.
    pub fn try_acquire(&self, lock_key: &str) -> Result<Option<String>, StorageError> {
        let token = new_token();
        let now = crate::epoch_secs();
        let conn = self.conn.lock().expect("lock db lock poisoned");
        conn.execute(
            "DELETE FROM repo_locks WHERE lock_key = ?1 AND expires_at <= ?2",
            params![lock_key, now],
        )?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO repo_locks (lock_key, token, expires_at)
             VALUES (?1, ?2, ?3)",
            params![lock_key, token, now + self.ttl_secs],
        )?;
        Ok(if inserted == 1 { Some(token) } else { None })
    }

    /// Release the lock if (and only if) `token` still holds it.
    pub fn release(&self, lock_key: &str, token: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().expect("lock db lock poisoned");
        let deleted = conn.execute(
            "DELETE FROM repo_locks WHERE lock_key = ?1 AND token = ?2",
            params![lock_key, token],
        )?;
        Ok(deleted == 1)
    }

    /// Extend the TTL of a held lock. Fails when the token no longer holds it.
    pub fn extend(&self, lock_key: &str, token: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("lock db lock poisoned");
        let updated = conn.execute(
            "UPDATE repo_locks SET expires_at = ?1 WHERE lock_key = ?2 AND token = ?3",
            params![crate::epoch_secs() + self.ttl_secs, lock_key, token],
        )?;
        if updated == 1 {
            Ok(())
        } else {
            Err(StorageError::LockNotHeld {
                key: lock_key.to_string(),
            })
        }
    }

    #[cfg(test)]
    fn expire_now(&self, lock_key: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE repo_locks SET expires_at = ?1 WHERE lock_key = ?2",
            params![crate::epoch_secs() - 1, lock_key],
        )
        .unwrap();
    }
}
