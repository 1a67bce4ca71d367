use std::collections::HashSet;
use std::path::PathBuf;

use strata_core::{ChunkId, GraphDocument, GraphNode, IndexDocument, SearchHit};

use crate::error::IndexError;

/// Source-file based text search (base + delta lexical layers).
pub trait LexicalIndexPort: Send + Sync {
    /// Rebuild the whole base index for a (repo, snapshot) from the working set.
    fn reindex_repo(&self, repo_id: &str, snapshot_id: &str) -> Result<(), IndexError>;

    /// Reindex a set of paths. Implementations MAY upgrade a large set
    /// (>= 10 paths) to a full reindex.
    fn reindex_paths(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        paths: &[String],
    ) -> Result<(), IndexError>;

    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;

    fn delete_repo(&self, repo_id: &str, snapshot_id: &str) -> Result<(), IndexError>;
}

/// Embedding-based semantic search over `IndexDocument`s.
/// One collection per (repo, snapshot); the embedding dimension is fixed
/// per installation.
pub trait VectorIndexPort: Send + Sync {
    /// Full (re)index: replaces the collection with `docs`.
    fn index(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError>;

    fn upsert(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError>;

    fn delete(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        ids: &[ChunkId],
    ) -> Result<(), IndexError>;

    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
        candidates: Option<&HashSet<ChunkId>>,
    ) -> Result<Vec<SearchHit>, IndexError>;
}

/// Graph-backed symbol navigation with intent-routed queries.
pub trait SymbolIndexPort: Send + Sync {
    fn index_graph(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        graph_doc: &GraphDocument,
    ) -> Result<(), IndexError>;

    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;

    fn get_callers(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;

    fn get_callees(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;

    fn get_references(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;

    fn get_node_by_id(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol_id: &str,
    ) -> Result<Option<GraphNode>, IndexError>;

    fn delete_repo(&self, repo_id: &str, snapshot_id: &str) -> Result<(), IndexError>;
}

/// Trigram-based identifier matching with similarity scores.
pub trait FuzzyIndexPort: Send + Sync {
    fn index(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError>;

    fn upsert(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError>;

    fn delete(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        ids: &[ChunkId],
    ) -> Result<(), IndexError>;

    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;
}

/// Documentation-chunk search; same shape as the vector port.
pub trait DomainMetaIndexPort: Send + Sync {
    fn index(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError>;

    fn upsert(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError>;

    fn delete(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        ids: &[ChunkId],
    ) -> Result<(), IndexError>;

    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;
}

/// Execution-trace search. Reserved.
pub trait RuntimeIndexPort: Send + Sync {
    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError>;
}

/// External embedding model contract.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError>;
    fn dimension(&self) -> usize;
}

/// Maps a repo ID to its working-tree root on disk.
pub trait RepoRootResolver: Send + Sync {
    fn resolve(&self, repo_id: &str) -> Option<PathBuf>;
}

/// Static repo-root mapping.
#[derive(Debug, Default)]
pub struct StaticRepoRoots {
    roots: std::collections::HashMap<String, PathBuf>,
}

impl StaticRepoRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, repo_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(repo_id.into(), root.into());
        self
    }
}

impl RepoRootResolver for StaticRepoRoots {
    fn resolve(&self, repo_id: &str) -> Option<PathBuf> {
        self.roots.get(repo_id).cloned()
    }
}

/// Write access to the lexical delta layer, used as the reduced single-file
/// indexing path when no full pipeline is wired in.
pub trait DeltaWriter: Send + Sync {
    fn index_file_delta(
        &self,
        repo_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<(), IndexError>;

    fn delete_file_delta(&self, repo_id: &str, file_path: &str) -> Result<(), IndexError>;
}

/// Full single-file indexing pipeline (parse → IR → graph delta → chunk →
/// per-index upsert), provided by the outer orchestrator when available.
pub trait SingleFileIndexer: Send + Sync {
    fn index_file(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        file_path: &str,
    ) -> Result<(), IndexError>;
}

/// Queue for deferring large incremental-indexing batches.
pub trait FileQueue: Send + Sync {
    /// Enqueue paths for later indexing; returns the accepted count.
    fn enqueue_batch(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        file_paths: &[String],
        reason: Option<&str>,
        priority: i32,
    ) -> usize;

    fn is_idle(&self, repo_id: &str, snapshot_id: &str) -> bool;

    fn queue_size(&self) -> usize;
}
