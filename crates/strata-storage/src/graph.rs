use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use strata_core::{CallEdge, GraphDocument, GraphNode, ImportEdge};

use crate::error::StorageError;

/// Current schema version. Increment when schema changes.
const SCHEMA_VERSION: u32 = 1;

/// SQLite-backed symbol graph: nodes plus call and import edges, scoped to
/// `(repo_id, snapshot_id)`.
pub struct SymbolGraphStore {
    conn: Arc<Mutex<Connection>>,
}

impl SymbolGraphStore {
    /// Open or create a graph store at the given SQLite database path.
    ///
    /// A schema version mismatch is returned as an error so the caller can
    /// purge and retry.
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// Open an in-memory graph store (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        crate::delta::configure_pragmas(&conn)?;

        let stored_version: u32 =
            conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if stored_version != 0 && stored_version != SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                actual: stored_version,
            });
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS graph_nodes (
                 repo_id TEXT NOT NULL,
                 snapshot_id TEXT NOT NULL,
                 symbol_id TEXT NOT NULL,
                 name TEXT NOT NULL,
                 fqn TEXT NOT NULL,
                 kind TEXT,
                 file_path TEXT NOT NULL,
                 start_line INTEGER NOT NULL,
                 end_line INTEGER NOT NULL,
                 signature TEXT,
                 PRIMARY KEY (repo_id, snapshot_id, symbol_id)
             );
             CREATE INDEX IF NOT EXISTS idx_graph_nodes_name
                 ON graph_nodes (repo_id, snapshot_id, name);
             CREATE TABLE IF NOT EXISTS call_edges (
                 repo_id TEXT NOT NULL,
                 snapshot_id TEXT NOT NULL,
                 caller_id TEXT NOT NULL,
                 callee_id TEXT NOT NULL,
                 PRIMARY KEY (repo_id, snapshot_id, caller_id, callee_id)
             );
             CREATE TABLE IF NOT EXISTS import_edges (
                 repo_id TEXT NOT NULL,
                 snapshot_id TEXT NOT NULL,
                 importer_path TEXT NOT NULL,
                 module TEXT NOT NULL,
                 PRIMARY KEY (repo_id, snapshot_id, importer_path, module)
             );",
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Replace the whole graph for one (repo, snapshot) with `doc`.
    pub fn index_graph(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        doc: &GraphDocument,
        batch_size: usize,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("graph db lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM graph_nodes WHERE repo_id = ?1 AND snapshot_id = ?2",
            params![repo_id, snapshot_id],
        )?;
        tx.execute(
            "DELETE FROM call_edges WHERE repo_id = ?1 AND snapshot_id = ?2",
            params![repo_id, snapshot_id],
        )?;
        tx.execute(
            "DELETE FROM import_edges WHERE repo_id = ?1 AND snapshot_id = ?2",
            params![repo_id, snapshot_id],
        )?;
        tx.commit()?;

        for chunk in doc.nodes.chunks(batch_size) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO graph_nodes \
                     (repo_id, snapshot_id, symbol_id, name, fqn, kind, file_path, \
                      start_line, end_line, signature) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?;
                for node in chunk {
                    stmt.execute(params![
                        repo_id,
                        snapshot_id,
                        node.symbol_id,
                        node.name,
                        node.fqn,
                        node.kind.as_deref(),
                        node.file_path,
                        node.start_line as i64,
                        node.end_line as i64,
                        node.signature.as_deref(),
                    ])?;
                }
            }
            tx.commit()?;
        }

        for chunk in doc.call_edges.chunks(batch_size) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO call_edges \
                     (repo_id, snapshot_id, caller_id, callee_id) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for edge in chunk {
                    stmt.execute(params![repo_id, snapshot_id, edge.caller_id, edge.callee_id])?;
                }
            }
            tx.commit()?;
        }

        for chunk in doc.import_edges.chunks(batch_size) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO import_edges \
                     (repo_id, snapshot_id, importer_path, module) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for edge in chunk {
                    stmt.execute(params![repo_id, snapshot_id, edge.importer_path, edge.module])?;
                }
            }
            tx.commit()?;
        }

        tracing::info!(
            repo_id,
            snapshot_id,
            nodes = doc.nodes.len(),
            call_edges = doc.call_edges.len(),
            import_edges = doc.import_edges.len(),
            "graph indexed"
        );
        Ok(())
    }

    /// Look up a node by its exact symbol ID.
    pub fn get_node(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol_id: &str,
    ) -> Result<Option<GraphNode>, StorageError> {
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLS} FROM graph_nodes \
             WHERE repo_id = ?1 AND snapshot_id = ?2 AND symbol_id = ?3"
        ))?;
        let mut rows = stmt.query(params![repo_id, snapshot_id, symbol_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_node(row)?)),
            None => Ok(None),
        }
    }

    /// Substring search over node names and FQNs.
    pub fn search_nodes(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, StorageError> {
        let pattern = format!("%{}%", like_escape(needle));
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLS} FROM graph_nodes \
             WHERE repo_id = ?1 AND snapshot_id = ?2 \
               AND (name LIKE ?3 ESCAPE '\\' OR fqn LIKE ?3 ESCAPE '\\') \
             ORDER BY length(fqn) LIMIT ?4"
        ))?;
        let result = collect_nodes(stmt.query(params![repo_id, snapshot_id, pattern, limit as i64])?);
        result
    }

    /// Prefix search over node names and FQNs (used for intent targets).
    pub fn find_nodes_by_prefix(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, StorageError> {
        let pattern = format!("{}%", like_escape(prefix));
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLS} FROM graph_nodes \
             WHERE repo_id = ?1 AND snapshot_id = ?2 \
               AND (name LIKE ?3 ESCAPE '\\' OR fqn LIKE ?3 ESCAPE '\\') \
             ORDER BY length(fqn) LIMIT ?4"
        ))?;
        let result = collect_nodes(stmt.query(params![repo_id, snapshot_id, pattern, limit as i64])?);
        result
    }

    /// Nodes whose call edges point at any node matching `target_needle`.
    pub fn get_callers(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        target_needle: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, StorageError> {
        let pattern = format!("%{}%", like_escape(target_needle));
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT DISTINCT {NODE_COLS_N} FROM graph_nodes n \
             JOIN call_edges e \
               ON e.repo_id = n.repo_id AND e.snapshot_id = n.snapshot_id \
              AND e.caller_id = n.symbol_id \
             JOIN graph_nodes t \
               ON t.repo_id = e.repo_id AND t.snapshot_id = e.snapshot_id \
              AND t.symbol_id = e.callee_id \
             WHERE n.repo_id = ?1 AND n.snapshot_id = ?2 \
               AND (t.name LIKE ?3 ESCAPE '\\' OR t.fqn LIKE ?3 ESCAPE '\\') \
             LIMIT ?4"
        ))?;
        let result = collect_nodes(stmt.query(params![repo_id, snapshot_id, pattern, limit as i64])?);
        result
    }

    /// Nodes called by any node matching `source_needle`.
    pub fn get_callees(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        source_needle: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, StorageError> {
        let pattern = format!("%{}%", like_escape(source_needle));
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT DISTINCT {NODE_COLS_N} FROM graph_nodes n \
             JOIN call_edges e \
               ON e.repo_id = n.repo_id AND e.snapshot_id = n.snapshot_id \
              AND e.callee_id = n.symbol_id \
             JOIN graph_nodes s \
               ON s.repo_id = e.repo_id AND s.snapshot_id = e.snapshot_id \
              AND s.symbol_id = e.caller_id \
             WHERE n.repo_id = ?1 AND n.snapshot_id = ?2 \
               AND (s.name LIKE ?3 ESCAPE '\\' OR s.fqn LIKE ?3 ESCAPE '\\') \
             LIMIT ?4"
        ))?;
        let result = collect_nodes(stmt.query(params![repo_id, snapshot_id, pattern, limit as i64])?);
        result
    }

    /// Importer paths for modules matching `module_needle`.
    pub fn get_importers(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        module_needle: &str,
        limit: usize,
    ) -> Result<Vec<ImportEdge>, StorageError> {
        let pattern = format!("%{}%", like_escape(module_needle));
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT importer_path, module FROM import_edges \
             WHERE repo_id = ?1 AND snapshot_id = ?2 AND module LIKE ?3 ESCAPE '\\' \
             LIMIT ?4",
        )?;
        let mut rows = stmt.query(params![repo_id, snapshot_id, pattern, limit as i64])?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            edges.push(ImportEdge {
                importer_path: row.get(0)?,
                module: row.get(1)?,
            });
        }
        Ok(edges)
    }

    /// All call edges for one (repo, snapshot).
    pub fn call_edges(
        &self,
        repo_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<CallEdge>, StorageError> {
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT caller_id, callee_id FROM call_edges \
             WHERE repo_id = ?1 AND snapshot_id = ?2",
        )?;
        let mut rows = stmt.query(params![repo_id, snapshot_id])?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            edges.push(CallEdge {
                caller_id: row.get(0)?,
                callee_id: row.get(1)?,
            });
        }
        Ok(edges)
    }

    /// All import edges for one (repo, snapshot).
    pub fn import_edges(
        &self,
        repo_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<ImportEdge>, StorageError> {
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT importer_path, module FROM import_edges \
             WHERE repo_id = ?1 AND snapshot_id = ?2",
        )?;
        let mut rows = stmt.query(params![repo_id, snapshot_id])?;
        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            edges.push(ImportEdge {
                importer_path: row.get(0)?,
                module: row.get(1)?,
            });
        }
        Ok(edges)
    }

    /// Drop all graph data for one (repo, snapshot).
    pub fn delete_snapshot(&self, repo_id: &str, snapshot_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("graph db lock poisoned");
        conn.execute(
            "DELETE FROM graph_nodes WHERE repo_id = ?1 AND snapshot_id = ?2",
            params![repo_id, snapshot_id],
        )?;
        conn.execute(
            "DELETE FROM call_edges WHERE repo_id = ?1 AND snapshot_id = ?2",
            params![repo_id, snapshot_id],
        )?;
        conn.execute(
            "DELETE FROM import_edges WHERE repo_id = ?1 AND snapshot_id = ?2",
            params![repo_id, snapshot_id],
        )?;
        Ok(())
    }

    pub fn count_nodes(&self, repo_id: &str, snapshot_id: &str) -> Result<usize, StorageError> {
        let conn = self.conn.lock().expect("graph db lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM graph_nodes WHERE repo_id = ?1 AND snapshot_id = ?2",
            params![repo_id, snapshot_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

const NODE_COLS: &str =
    "symbol_id, name, fqn, kind, file_path, start_line, end_line, signature";
const NODE_COLS_N: &str =
    "n.symbol_id, n.name, n.fqn, n.kind, n.file_path, n.start_line, n.end_line, n.signature";

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn row_to_node(row: &rusqlite::Row<'_>) -> Result<GraphNode, rusqlite::Error> {
    Ok(GraphNode {
        symbol_id: row.get(0)?,
        name: row.get(1)?,
        fqn: row.get(2)?,
        kind: row.get(3)?,
        file_path: row.get(4)?,
        start_line: row.get::<_, i64>(5)? as u32,
        end_line: row.get::<_, i64>(6)? as u32,
        signature: row.get(7)?,
    })
}

fn collect_nodes(mut rows: rusqlite::Rows<'_>) -> Result<Vec<GraphNode>, StorageError> {
    let mut nodes = Vec::new();
    while let Some(row) = rows.next()? {
        nodes.push(row_to_node(row)?);
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str, file: &str) -> GraphNode {
        GraphNode {
            symbol_id: id.to_string(),
            name: name.to_string(),
            fqn: id.to_string(),
            kind: Some("function".to_string()),
            file_path: file.to_string(),
            start_line: 0,
            end_line: 10,
            signature: Some(format!("def {name}()")),
        }
    }

    fn sample_doc() -> GraphDocument {
        GraphDocument {
            nodes: vec![
                node("app.main", "main", "src/app.py"),
                node("app.helper", "helper", "src/app.py"),
                node("utils.format", "format", "src/utils.py"),
            ],
            call_edges: vec![
                CallEdge { caller_id: "app.main".into(), callee_id: "app.helper".into() },
                CallEdge { caller_id: "app.helper".into(), callee_id: "utils.format".into() },
            ],
            import_edges: vec![ImportEdge {
                importer_path: "src/app.py".into(),
                module: "utils".into(),
            }],
        }
    }

    #[test]
    fn index_and_lookup() {
        let store = SymbolGraphStore::open_in_memory().unwrap();
        store.index_graph("r1", "s1", &sample_doc(), 100).unwrap();

        assert_eq!(store.count_nodes("r1", "s1").unwrap(), 3);
        let n = store.get_node("r1", "s1", "app.main").unwrap().unwrap();
        assert_eq!(n.name, "main");
        assert!(store.get_node("r1", "s1", "nope").unwrap().is_none());
    }

    #[test]
    fn reindex_replaces_snapshot() {
        let store = SymbolGraphStore::open_in_memory().unwrap();
        store.index_graph("r1", "s1", &sample_doc(), 100).unwrap();

        let smaller = GraphDocument {
            nodes: vec![node("app.main", "main", "src/app.py")],
            ..Default::default()
        };
        store.index_graph("r1", "s1", &smaller, 100).unwrap();
        assert_eq!(store.count_nodes("r1", "s1").unwrap(), 1);
        assert!(store.call_edges("r1", "s1").unwrap().is_empty());
    }

    #[test]
    fn callers_and_callees() {
        let store = SymbolGraphStore::open_in_memory().unwrap();
        store.index_graph("r1", "s1", &sample_doc(), 100).unwrap();

        let callers = store.get_callers("r1", "s1", "helper", 10).unwrap();
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0].symbol_id, "app.main");

        let callees = store.get_callees("r1", "s1", "helper", 10).unwrap();
        assert_eq!(callees.len(), 1);
        assert_eq!(callees[0].symbol_id, "utils.format");
    }

    #[test]
    fn importers() {
        let store = SymbolGraphStore::open_in_memory().unwrap();
        store.index_graph("r1", "s1", &sample_doc(), 100).unwrap();

        let importers = store.get_importers("r1", "s1", "utils", 10).unwrap();
        assert_eq!(importers.len(), 1);
        assert_eq!(importers[0].importer_path, "src/app.py");
    }

    #[test]
    fn substring_and_prefix_search() {
        let store = SymbolGraphStore::open_in_memory().unwrap();
        store.index_graph("r1", "s1", &sample_doc(), 100).unwrap();

        assert_eq!(store.search_nodes("r1", "s1", "help", 10).unwrap().len(), 1);
        assert_eq!(store.search_nodes("r1", "s1", "app.", 10).unwrap().len(), 2);
        assert_eq!(
            store.find_nodes_by_prefix("r1", "s1", "utils.", 10).unwrap().len(),
            1
        );
        assert!(store.find_nodes_by_prefix("r1", "s1", "format", 10).unwrap().len() >= 1);
    }

    #[test]
    fn like_wildcards_are_escaped() {
        let store = SymbolGraphStore::open_in_memory().unwrap();
        store.index_graph("r1", "s1", &sample_doc(), 100).unwrap();
        // A bare "%" must not match everything
        assert!(store.search_nodes("r1", "s1", "%", 10).unwrap().is_empty());
    }

    #[test]
    fn snapshot_isolation_and_delete() {
        let store = SymbolGraphStore::open_in_memory().unwrap();
        store.index_graph("r1", "s1", &sample_doc(), 100).unwrap();
        store.index_graph("r1", "s2", &sample_doc(), 100).unwrap();

        store.delete_snapshot("r1", "s1").unwrap();
        assert_eq!(store.count_nodes("r1", "s1").unwrap(), 0);
        assert_eq!(store.count_nodes("r1", "s2").unwrap(), 3);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.sqlite");
        {
            let store = SymbolGraphStore::open(&path).unwrap();
            store.index_graph("r1", "s1", &sample_doc(), 100).unwrap();
        }
        {
            let store = SymbolGraphStore::open(&path).unwrap();
            assert_eq!(store.count_nodes("r1", "s1").unwrap(), 3);
        }
    }
}
