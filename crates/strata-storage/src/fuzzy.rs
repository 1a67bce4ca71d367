use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use strata_core::ChunkId;

use crate::error::StorageError;

/// Minimum trigram similarity for a fuzzy match (pg_trgm's default).
const SIMILARITY_THRESHOLD: f32 = 0.3;

/// A fuzzy identifier match.
#[derive(Debug, Clone)]
pub struct FuzzyHit {
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub symbol_id: Option<String>,
    pub identifier: String,
    pub similarity: f32,
}

/// Trigram-based fuzzy identifier index.
///
/// Identifiers are stored lowercased per chunk; search computes trigram-set
/// similarity (shared / union over padded 3-grams) against every identifier
/// in the collection and keeps the best match per chunk.
pub struct TrigramStore {
    conn: Arc<Mutex<Connection>>,
}

impl TrigramStore {
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
            "CREATE TABLE IF NOT EXISTS identifiers (
                 repo_id TEXT NOT NULL,
                 snapshot_id TEXT NOT NULL,
                 chunk_id BLOB NOT NULL,
                 identifier TEXT NOT NULL,
                 file_path TEXT NOT NULL,
                 symbol_id TEXT,
                 PRIMARY KEY (repo_id, snapshot_id, chunk_id, identifier)
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Replace the identifier rows for one chunk.
    pub fn upsert_chunk(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        chunk_id: ChunkId,
        file_path: &str,
        symbol_id: Option<&str>,
        identifiers: &[String],
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("fuzzy db lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM identifiers \
             WHERE repo_id = ?1 AND snapshot_id = ?2 AND chunk_id = ?3",
            params![repo_id, snapshot_id, chunk_id.as_bytes().as_slice()],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO identifiers \
                 (repo_id, snapshot_id, chunk_id, identifier, file_path, symbol_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for ident in identifiers {
                let lowered = ident.to_lowercase();
                if lowered.is_empty() {
                    continue;
                }
                stmt.execute(params![
                    repo_id,
                    snapshot_id,
                    chunk_id.as_bytes().as_slice(),
                    lowered,
                    file_path,
                    symbol_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove all identifier rows for the given chunks.
    pub fn delete_chunks(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        chunk_ids: &[ChunkId],
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("fuzzy db lock poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM identifiers \
                 WHERE repo_id = ?1 AND snapshot_id = ?2 AND chunk_id = ?3",
            )?;
            for id in chunk_ids {
                stmt.execute(params![repo_id, snapshot_id, id.as_bytes().as_slice()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop every identifier row in a (repo, snapshot) collection.
    pub fn delete_collection(&self, repo_id: &str, snapshot_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("fuzzy db lock poisoned");
        conn.execute(
            "DELETE FROM identifiers WHERE repo_id = ?1 AND snapshot_id = ?2",
            params![repo_id, snapshot_id],
        )?;
        Ok(())
    }

    /// Fuzzy-match `query` against all identifiers in the collection.
    pub fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FuzzyHit>, StorageError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let needle_grams = trigrams(&needle);

        let conn = self.conn.lock().expect("fuzzy db lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT chunk_id, identifier, file_path, symbol_id FROM identifiers \
             WHERE repo_id = ?1 AND snapshot_id = ?2",
        )?;
        let mut rows = stmt.query(params![repo_id, snapshot_id])?;

        // Best match per chunk.
        let mut best: HashMap<ChunkId, FuzzyHit> = HashMap::new();
        while let Some(row) = rows.next()? {
            let raw: Vec<u8> = row.get(0)?;
            let bytes: [u8; 16] = match raw.try_into() {
                Ok(b) => b,
                Err(_) => continue,
            };
            let chunk_id = ChunkId::from_bytes(bytes);
            let identifier: String = row.get(1)?;
            let sim = similarity(&needle_grams, &trigrams(&identifier));
            if sim < SIMILARITY_THRESHOLD {
                continue;
            }
            let hit = FuzzyHit {
                chunk_id,
                file_path: row.get(2)?,
                symbol_id: row.get(3)?,
                identifier,
                similarity: sim,
            };
            match best.get(&chunk_id) {
                Some(existing) if existing.similarity >= sim => {}
                _ => {
                    best.insert(chunk_id, hit);
                }
            }
        }

        let mut hits: Vec<FuzzyHit> = best.into_values().collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Padded 3-gram set of a lowercase string, pg_trgm style: two leading
/// spaces and one trailing space, so short strings still produce grams.
fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let padded: Vec<char> = std::iter::repeat(' ')
        .take(2)
        .chain(s.chars())
        .chain(std::iter::once(' '))
        .collect();
    padded
        .windows(3)
        .map(|w| [w[0], w[1], w[2]])
        .collect()
}

/// Trigram-set similarity: |shared| / |union|.
fn similarity(a: &HashSet<[char; 3]>, b: &HashSet<[char; 3]>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    if union == 0 {
        0.0
    } else {
        shared as f32 / union as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_full_similarity() {
        let a = trigrams("calculate");
        assert!((similarity(&a, &a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn disjoint_strings_zero_similarity() {
        assert_eq!(similarity(&trigrams("abc"), &trigrams("xyz")), 0.0);
    }

    #[test]
    fn typo_stays_above_threshold() {
        let sim = similarity(&trigrams("calculate"), &trigrams("calcualte"));
        assert!(sim >= SIMILARITY_THRESHOLD, "sim = {sim}");
    }

    fn store_with_sample() -> TrigramStore {
        let store = TrigramStore::open_in_memory().unwrap();
        store
            .upsert_chunk(
                "r1",
                "s1",
                ChunkId(1),
                "src/calc.py",
                Some("calc.calculate_total"),
                &["calculate_total".into(), "items".into()],
            )
            .unwrap();
        store
            .upsert_chunk(
                "r1",
                "s1",
                ChunkId(2),
                "src/render.py",
                None,
                &["render_page".into()],
            )
            .unwrap();
        store
    }

    #[test]
    fn typo_tolerant_search() {
        let store = store_with_sample();
        let hits = store.search("r1", "s1", "calcualte_total", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, ChunkId(1));
        assert_eq!(hits[0].identifier, "calculate_total");
    }

    #[test]
    fn one_hit_per_chunk() {
        let store = TrigramStore::open_in_memory().unwrap();
        store
            .upsert_chunk(
                "r1",
                "s1",
                ChunkId(1),
                "a.py",
                None,
                &["parse".into(), "parser".into(), "parsers".into()],
            )
            .unwrap();
        let hits = store.search("r1", "s1", "parse", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identifier, "parse");
    }

    #[test]
    fn upsert_replaces_identifiers() {
        let store = store_with_sample();
        store
            .upsert_chunk("r1", "s1", ChunkId(1), "src/calc.py", None, &["sum_all".into()])
            .unwrap();
        assert!(store.search("r1", "s1", "calculate_total", 10).unwrap().is_empty());
        assert_eq!(store.search("r1", "s1", "sum_all", 10).unwrap().len(), 1);
    }

    #[test]
    fn delete_chunks_and_collection() {
        let store = store_with_sample();
        store.delete_chunks("r1", "s1", &[ChunkId(1)]).unwrap();
        assert!(store.search("r1", "s1", "calculate_total", 10).unwrap().is_empty());
        assert_eq!(store.search("r1", "s1", "render_page", 10).unwrap().len(), 1);

        store.delete_collection("r1", "s1").unwrap();
        assert!(store.search("r1", "s1", "render_page", 10).unwrap().is_empty());
    }

    #[test]
    fn below_threshold_excluded() {
        let store = store_with_sample();
        assert!(store.search("r1", "s1", "zzzz", 10).unwrap().is_empty());
    }

    #[test]
    fn empty_query_returns_empty() {
        let store = store_with_sample();
        assert!(store.search("r1", "s1", "   ", 10).unwrap().is_empty());
    }
}
