use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::StorageError;

/// A delta write captured while the delta is frozen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeEvent {
    Index { file_path: String, content: String },
    Delete { file_path: String },
}

/// Buffer for delta writes during compaction's read-only window.
///
/// Owned by the compaction manager: it freezes a repo, base rebuild runs,
/// then buffered events are replayed (in order) and the buffer is cleared.
pub struct FreezeBuffer {
    conn: Arc<Mutex<Connection>>,
}

impl FreezeBuffer {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self, StorageError> {
        {
            let guard = conn.lock().expect("delta db lock poisoned");
            guard.execute_batch(
                "CREATE TABLE IF NOT EXISTS freeze_state (
                     repo_id TEXT PRIMARY KEY,
                     frozen INTEGER NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS freeze_events (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     repo_id TEXT NOT NULL,
                     operation TEXT NOT NULL,
                     file_path TEXT NOT NULL,
                     content TEXT
                 );",
            )?;
        }
        Ok(Self { conn })
    }

    pub fn set_frozen(&self, repo_id: &str, frozen: bool) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        conn.execute(
            "INSERT INTO freeze_state (repo_id, frozen) VALUES (?1, ?2)
             ON CONFLICT(repo_id) DO UPDATE SET frozen = ?2",
            params![repo_id, frozen as i64],
        )?;
        Ok(())
    }

    pub fn is_frozen(&self, repo_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        let frozen: Option<i64> = conn
            .query_row(
                "SELECT frozen FROM freeze_state WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(frozen.unwrap_or(0) != 0)
    }

    /// Append one event to the buffer.
    pub fn push(&self, repo_id: &str, event: &FreezeEvent) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        match event {
            FreezeEvent::Index { file_path, content } => conn.execute(
                "INSERT INTO freeze_events (repo_id, operation, file_path, content)
                 VALUES (?1, 'index', ?2, ?3)",
                params![repo_id, file_path, content],
            )?,
            FreezeEvent::Delete { file_path } => conn.execute(
                "INSERT INTO freeze_events (repo_id, operation, file_path, content)
                 VALUES (?1, 'delete', ?2, NULL)",
                params![repo_id, file_path],
            )?,
        };
        Ok(())
    }

    /// All buffered events for a repo, in arrival order. Does not clear.
    pub fn replay(&self, repo_id: &str) -> Result<Vec<FreezeEvent>, StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT operation, file_path, content FROM freeze_events
             WHERE repo_id = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![repo_id])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let op: String = row.get(0)?;
            let file_path: String = row.get(1)?;
            match op.as_str() {
                "index" => events.push(FreezeEvent::Index {
                    file_path,
                    content: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                }),
                "delete" => events.push(FreezeEvent::Delete { file_path }),
                other => tracing::warn!(operation = other, "unknown freeze event, skipping"),
            }
        }
        Ok(events)
    }

    pub fn clear(&self, repo_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("delta db lock poisoned");
        conn.execute(
            "DELETE FROM freeze_events WHERE repo_id = ?1",
            params![repo_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::open_delta_db_in_memory;

    #[test]
    fn frozen_flag_round_trip() {
        let buf = FreezeBuffer::new(open_delta_db_in_memory().unwrap()).unwrap();
        assert!(!buf.is_frozen("r1").unwrap());
        buf.set_frozen("r1", true).unwrap();
        assert!(buf.is_frozen("r1").unwrap());
        assert!(!buf.is_frozen("r2").unwrap());
        buf.set_frozen("r1", false).unwrap();
        assert!(!buf.is_frozen("r1").unwrap());
    }

    #[test]
    fn replay_preserves_order() {
        let buf = FreezeBuffer::new(open_delta_db_in_memory().unwrap()).unwrap();
        buf.push(
            "r1",
            &FreezeEvent::Index {
                file_path: "a.py".into(),
                content: "one".into(),
            },
        )
        .unwrap();
        buf.push("r1", &FreezeEvent::Delete { file_path: "b.py".into() }).unwrap();
        buf.push(
            "r1",
            &FreezeEvent::Index {
                file_path: "a.py".into(),
                content: "two".into(),
            },
        )
        .unwrap();

        let events = buf.replay("r1").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            FreezeEvent::Index { file_path: "a.py".into(), content: "one".into() }
        );
        assert_eq!(events[1], FreezeEvent::Delete { file_path: "b.py".into() });
        assert_eq!(
            events[2],
            FreezeEvent::Index { file_path: "a.py".into(), content: "two".into() }
        );
    }

    #[test]
    fn replay_does_not_clear() {
        let buf = FreezeBuffer::new(open_delta_db_in_memory().unwrap()).unwrap();
        buf.push("r1", &FreezeEvent::Delete { file_path: "x.py".into() }).unwrap();
        assert_eq!(buf.replay("r1").unwrap().len(), 1);
        assert_eq!(buf.replay("r1").unwrap().len(), 1);

        buf.clear("r1").unwrap();
        assert!(buf.replay("r1").unwrap().is_empty());
    }
}
