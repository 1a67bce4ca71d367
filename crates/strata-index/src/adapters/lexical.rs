use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ignore::WalkBuilder;
use strata_core::{ChunkId, HitMetadata, SearchHit, SearchSource};
use strata_storage::delta::DeltaLexicalStore;
use strata_storage::freeze::{FreezeBuffer, FreezeEvent};
use strata_storage::fulltext::BaseLexicalStore;

use crate::error::IndexError;
use crate::filter;
use crate::ports::{DeltaWriter, LexicalIndexPort, RepoRootResolver};

/// Incremental reindex of at least this many paths upgrades to a full
/// reindex.
const FULL_REINDEX_THRESHOLD: usize = 10;

const MAX_FILE_SIZE: u64 = 1_048_576;

/// Base + delta merging lexical index.
///
/// The tantivy base holds the last committed snapshot; the SQLite delta
/// holds per-file writes since then. Queries consult delta first and fall
/// back to the base, deduplicating by path with delta precedence and
/// suppressing tombstoned base hits. Delta writes made while the repo is
/// frozen (compaction in flight) are redirected to the freeze buffer.
pub struct MergingLexicalIndex {
    base: Mutex<BaseLexicalStore>,
    delta: Arc<DeltaLexicalStore>,
    freeze: Arc<FreezeBuffer>,
    repo_roots: Arc<dyn RepoRootResolver>,
}

impl MergingLexicalIndex {
    pub fn new(
        base: BaseLexicalStore,
        delta: Arc<DeltaLexicalStore>,
        freeze: Arc<FreezeBuffer>,
        repo_roots: Arc<dyn RepoRootResolver>,
    ) -> Self {
        Self {
            base: Mutex::new(base),
            delta,
            freeze,
            repo_roots,
        }
    }

    /// Write one file into the delta layer (or the freeze buffer while the
    /// repo is frozen).
    pub fn index_file_delta(
        &self,
        repo_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<(), IndexError> {
        if self.freeze.is_frozen(repo_id)? {
            self.freeze.push(
                repo_id,
                &FreezeEvent::Index {
                    file_path: file_path.to_string(),
                    content: content.to_string(),
                },
            )?;
            return Ok(());
        }
        self.delta.index_file(repo_id, file_path, content, None)?;
        Ok(())
    }

    /// Delete one file from the delta layer (tombstoning it), or buffer the
    /// deletion while frozen.
    pub fn delete_file_delta(&self, repo_id: &str, file_path: &str) -> Result<(), IndexError> {
        if self.freeze.is_frozen(repo_id)? {
            self.freeze.push(
                repo_id,
                &FreezeEvent::Delete {
                    file_path: file_path.to_string(),
                },
            )?;
            return Ok(());
        }
        self.delta.delete_file(repo_id, file_path, None)?;
        Ok(())
    }

    pub fn delta(&self) -> &Arc<DeltaLexicalStore> {
        &self.delta
    }

    fn base_hit_to_search_hit(
        repo_id: &str,
        hit: strata_storage::fulltext::BaseLexicalHit,
    ) -> SearchHit {
        SearchHit {
            chunk_id: ChunkId::virtual_for_file(repo_id, &hit.file_path),
            file_path: Some(hit.file_path),
            symbol_id: None,
            score: hit.score,
            source: SearchSource::Lexical,
            metadata: HitMetadata {
                line: hit.line,
                preview: hit.preview,
                mapped: Some(false),
                extra: [("layer".to_string(), "base".to_string())].into_iter().collect(),
                ..Default::default()
            },
        }
    }

    fn delta_hit_to_search_hit(repo_id: &str, hit: strata_storage::delta::DeltaHit) -> SearchHit {
        SearchHit {
            chunk_id: ChunkId::virtual_for_file(repo_id, &hit.file_path),
            file_path: Some(hit.file_path),
            symbol_id: None,
            score: hit.score,
            source: SearchSource::Lexical,
            metadata: HitMetadata {
                preview: Some(hit.snippet),
                mapped: Some(false),
                extra: [("layer".to_string(), "delta".to_string())].into_iter().collect(),
                ..Default::default()
            },
        }
    }
}

impl LexicalIndexPort for MergingLexicalIndex {
    #[tracing::instrument(skip(self))]
    fn reindex_repo(&self, repo_id: &str, snapshot_id: &str) -> Result<(), IndexError> {
        let root = self
            .repo_roots
            .resolve(repo_id)
            .ok_or_else(|| IndexError::RepoRootUnresolved {
                repo_id: repo_id.to_string(),
            })?;

        let files = scan_source_files(&root);
        let mut base = self.base.lock().expect("base lexical lock poisoned");
        base.delete_collection(repo_id, snapshot_id)?;
        let count = files.len();
        for (rel_path, content) in files {
            base.index_file(repo_id, snapshot_id, &rel_path, &content)?;
        }
        base.commit()?;
        tracing::info!(repo_id, snapshot_id, files = count, "base lexical reindexed");
        Ok(())
    }

    fn reindex_paths(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        paths: &[String],
    ) -> Result<(), IndexError> {
        if paths.len() >= FULL_REINDEX_THRESHOLD {
            tracing::info!(
                repo_id,
                count = paths.len(),
                "path set large, upgrading to full reindex"
            );
            return self.reindex_repo(repo_id, snapshot_id);
        }

        let root = self
            .repo_roots
            .resolve(repo_id)
            .ok_or_else(|| IndexError::RepoRootUnresolved {
                repo_id: repo_id.to_string(),
            })?;

        let mut base = self.base.lock().expect("base lexical lock poisoned");
        for path in paths {
            let abs = root.join(path);
            match std::fs::read(&abs) {
                Ok(bytes) if !filter::is_binary(&bytes) => {
                    let content = String::from_utf8_lossy(&bytes);
                    base.index_file(repo_id, snapshot_id, path, &content)?;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    base.remove_file(repo_id, snapshot_id, path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        base.commit()?;
        Ok(())
    }

    /// Merge-search: delta first, base second, delta wins per path.
    #[tracing::instrument(skip(self, query), fields(result_count))]
    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let delta_count = self.delta.count(repo_id)?;

        if delta_count == 0 {
            let base = self.base.lock().expect("base lexical lock poisoned");
            let hits: Vec<SearchHit> = base
                .search(repo_id, snapshot_id, query, limit)?
                .into_iter()
                .map(|h| Self::base_hit_to_search_hit(repo_id, h))
                .collect();
            tracing::Span::current().record("result_count", hits.len());
            return Ok(hits);
        }

        let delta_hits = self.delta.search(repo_id, query, limit)?;

        // Delta alone satisfies the limit: skip the base entirely.
        if delta_hits.len() >= limit {
            let hits: Vec<SearchHit> = delta_hits
                .into_iter()
                .take(limit)
                .map(|h| Self::delta_hit_to_search_hit(repo_id, h))
                .collect();
            tracing::Span::current().record("result_count", hits.len());
            return Ok(hits);
        }

        let base_hits = {
            let base = self.base.lock().expect("base lexical lock poisoned");
            base.search(repo_id, snapshot_id, query, limit * 2)?
        };
        let tombstones = self.delta.tombstones().paths_for_repo(repo_id)?;
        let delta_paths: HashSet<String> =
            delta_hits.iter().map(|h| h.file_path.clone()).collect();

        let mut merged: Vec<SearchHit> = delta_hits
            .into_iter()
            .map(|h| Self::delta_hit_to_search_hit(repo_id, h))
            .collect();
        for hit in base_hits {
            if tombstones.contains(&hit.file_path) {
                continue;
            }
            if delta_paths.contains(&hit.file_path) {
                continue; // delta wins
            }
            merged.push(Self::base_hit_to_search_hit(repo_id, hit));
        }
        merged.truncate(limit);

        tracing::Span::current().record("result_count", merged.len());
        tracing::debug!(
            delta = delta_paths.len(),
            merged = merged.len(),
            "merged lexical search"
        );
        Ok(merged)
    }

    fn delete_repo(&self, repo_id: &str, snapshot_id: &str) -> Result<(), IndexError> {
        {
            let mut base = self.base.lock().expect("base lexical lock poisoned");
            base.delete_collection(repo_id, snapshot_id)?;
        }
        self.delta.clear(repo_id)?;
        self.delta.tombstones().clear(repo_id)?;
        Ok(())
    }
}

impl DeltaWriter for MergingLexicalIndex {
    fn index_file_delta(
        &self,
        repo_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<(), IndexError> {
        MergingLexicalIndex::index_file_delta(self, repo_id, file_path, content)
    }

    fn delete_file_delta(&self, repo_id: &str, file_path: &str) -> Result<(), IndexError> {
        MergingLexicalIndex::delete_file_delta(self, repo_id, file_path)
    }
}

/// Gitignore-aware walk of the working set, mirroring the incremental
/// filter's drop rules (vendor dirs, hidden, generated, binary, oversize).
fn scan_source_files(root: &Path) -> Vec<(String, String)> {
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .follow_links(false)
        .filter_entry(|entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                if let Some(name) = entry.file_name().to_str() {
                    return !filter::is_vendor_dir_name(name);
                }
            }
            true
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if filter::is_generated_path(path) {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_SIZE).unwrap_or(true) {
            continue;
        }
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(_) => continue,
        };
        if filter::is_binary(&bytes) {
            continue;
        }
        let rel = match path.strip_prefix(root) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        files.push((rel, String::from_utf8_lossy(&bytes).into_owned()));
    }
    files
}
