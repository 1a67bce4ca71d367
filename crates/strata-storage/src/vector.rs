use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_core::ChunkId;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::StorageError;

/// A single k-NN search hit.
#[derive(Debug, Clone)]
pub struct VectorStoreHit {
    pub chunk_id: ChunkId,
    pub file_path: String,
    pub symbol_id: Option<String>,
    pub distance: f32,
}

/// Sidecar record for one stored vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorEntry {
    repo_id: String,
    snapshot_id: String,
    chunk_id: ChunkId,
    file_path: String,
    symbol_id: Option<String>,
}

/// HNSW vector index backed by usearch.
///
/// Configuration: cosine distance, fixed dimension per installation.
/// usearch keys are u64, so each vector is keyed by XXH3-64 of
/// `repo|snapshot|chunk` and a sidecar map carries the full identity; the
/// map is persisted as JSON alongside the usearch file.
pub struct VectorStore {
    index: Index,
    dimension: usize,
    entries: HashMap<u64, VectorEntry>,
}

fn create_index(dimension: usize) -> Result<Index, StorageError> {
    let mut options = IndexOptions::default();
    options.dimensions = dimension;
    options.metric = MetricKind::Cos;
    options.quantization = ScalarKind::F32;
    options.connectivity = 32; // M=32
    options.expansion_add = 200; // ef_construction=200
    options.expansion_search = 100; // ef_search=100

    Index::new(&options).map_err(|e| StorageError::VectorIndexUnavailable {
        reason: format!("index creation failed: {e}"),
    })
}

fn entry_key(repo_id: &str, snapshot_id: &str, chunk_id: ChunkId) -> u64 {
    xxh3_64(format!("{repo_id}|{snapshot_id}|{chunk_id}").as_bytes())
}

fn sidecar_path(path: &Path) -> std::path::PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".keys.json");
    std::path::PathBuf::from(p)
}

impl VectorStore {
    /// Create a new in-memory vector index with the given dimension.
    pub fn new(dimension: usize) -> Result<Self, StorageError> {
        Ok(Self {
            index: create_index(dimension)?,
            dimension,
            entries: HashMap::new(),
        })
    }

    /// Open an existing vector index from disk, or create a new one if the
    /// file doesn't exist.
    pub fn open(path: &Path, dimension: usize) -> Result<Self, StorageError> {
        if !path.exists() {
            return Self::new(dimension);
        }
        let index = create_index(dimension)?;
        index
            .load(path.to_str().unwrap_or(""))
            .map_err(|e| StorageError::VectorIndexUnavailable {
                reason: format!("failed to load vector index: {e}"),
            })?;
        let loaded_dim = index.dimensions();
        if loaded_dim != dimension {
            return Err(StorageError::DimensionMismatch {
                expected: dimension,
                actual: loaded_dim,
            });
        }
        let entries = match std::fs::read_to_string(sidecar_path(path)) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            index,
            dimension,
            entries,
        })
    }

    /// Persist the index and its sidecar key map.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.index
            .save(path.to_str().unwrap_or(""))
            .map_err(|e| StorageError::VectorIndexUnavailable {
                reason: format!("save failed: {e}"),
            })?;
        std::fs::write(sidecar_path(path), serde_json::to_string(&self.entries)?)?;
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add or overwrite the vector for one chunk. Idempotent per key.
    pub fn add_vector(
        &mut self,
        repo_id: &str,
        snapshot_id: &str,
        chunk_id: ChunkId,
        file_path: &str,
        symbol_id: Option<&str>,
        vector: &[f32],
    ) -> Result<(), StorageError> {
        if vector.len() != self.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let key = entry_key(repo_id, snapshot_id, chunk_id);
        if self.index.contains(key) {
            let _ = self.index.remove(key);
        }
        if self.index.size() >= self.index.capacity() {
            let new_cap = (self.index.capacity() + 1).max(64) * 2;
            self.index
                .reserve(new_cap)
                .map_err(|e| StorageError::VectorIndexUnavailable {
                    reason: format!("reserve failed: {e}"),
                })?;
        }
        self.index
            .add(key, vector)
            .map_err(|e| StorageError::VectorIndexUnavailable {
                reason: format!("add failed: {e}"),
            })?;
        self.entries.insert(
            key,
            VectorEntry {
                repo_id: repo_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                chunk_id,
                file_path: file_path.to_string(),
                symbol_id: symbol_id.map(str::to_string),
            },
        );
        Ok(())
    }

    /// Remove the vector for one chunk. Returns true if it existed.
    pub fn remove_vector(
        &mut self,
        repo_id: &str,
        snapshot_id: &str,
        chunk_id: ChunkId,
    ) -> Result<bool, StorageError> {
        let key = entry_key(repo_id, snapshot_id, chunk_id);
        if !self.index.contains(key) {
            self.entries.remove(&key);
            return Ok(false);
        }
        self.index
            .remove(key)
            .map_err(|e| StorageError::VectorIndexUnavailable {
                reason: format!("remove failed: {e}"),
            })?;
        self.entries.remove(&key);
        Ok(true)
    }

    /// Remove every vector belonging to a (repo, snapshot) collection.
    pub fn delete_collection(
        &mut self,
        repo_id: &str,
        snapshot_id: &str,
    ) -> Result<usize, StorageError> {
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.repo_id == repo_id && e.snapshot_id == snapshot_id)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            let _ = self.index.remove(*key);
            self.entries.remove(key);
        }
        Ok(keys.len())
    }

    /// k nearest neighbors within one collection.
    ///
    /// `candidates` optionally restricts hits to the given chunk IDs. The
    /// underlying HNSW search is global, so an oversampled pool is fetched
    /// and filtered down to the collection.
    pub fn search_knn(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &[f32],
        k: usize,
        candidates: Option<&HashSet<ChunkId>>,
    ) -> Result<Vec<VectorStoreHit>, StorageError> {
        if query.len() != self.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.index.size() == 0 {
            return Ok(Vec::new());
        }
        let pool = (k.max(16) * 8).min(self.index.size());
        let matches = self
            .index
            .search(query, pool)
            .map_err(|e| StorageError::VectorIndexUnavailable {
                reason: format!("search failed: {e}"),
            })?;

        let mut hits = Vec::with_capacity(k);
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let entry = match self.entries.get(key) {
                Some(e) => e,
                None => continue,
            };
            if entry.repo_id != repo_id || entry.snapshot_id != snapshot_id {
                continue;
            }
            if let Some(wanted) = candidates {
                if !wanted.contains(&entry.chunk_id) {
                    continue;
                }
            }
            hits.push(VectorStoreHit {
                chunk_id: entry.chunk_id,
                file_path: entry.file_path.clone(),
                symbol_id: entry.symbol_id.clone(),
                distance: *distance,
            });
            if hits.len() >= k {
                break;
            }
        }
        Ok(hits)
    }
}
