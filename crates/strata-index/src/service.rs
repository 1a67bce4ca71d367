use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strata_core::{Chunk, ChunkId, GraphDocument, IndexDocument, SearchHit, SearchSource};
use strata_storage::idempotency::IdempotencyStore;

use crate::adapters::vector::is_domain_doc;
use crate::error::IndexError;
use crate::filter::FileFilter;
use crate::ports::{
    DeltaWriter, DomainMetaIndexPort, FileQueue, FuzzyIndexPort, LexicalIndexPort,
    RepoRootResolver, RuntimeIndexPort, SingleFileIndexer, SymbolIndexPort, VectorIndexPort,
};
use crate::queue::EmbeddingQueue;
use crate::transformer::{IndexDocumentTransformer, RepoMapSnapshot};

/// Per-backend hit pool consulted before fusion.
const BACKEND_POOL_SIZE: usize = 100;

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Incremental batches above this size are queued instead of indexed
    /// inline (unless the caller's priority forces immediate execution).
    pub queue_threshold: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { queue_threshold: 10 }
    }
}

/// Default fusion weights per source.
pub fn default_weights() -> HashMap<SearchSource, f32> {
    [
        (SearchSource::Lexical, 0.3),
        (SearchSource::Vector, 0.3),
        (SearchSource::Symbol, 0.2),
        (SearchSource::Fuzzy, 0.1),
        (SearchSource::Domain, 0.1),
    ]
    .into_iter()
    .collect()
}

/// Changed-chunk sets produced by the chunk refresh layer.
#[derive(Debug, Clone, Default)]
pub struct ChunkRefreshResult {
    pub added_chunks: Vec<Chunk>,
    pub updated_chunks: Vec<Chunk>,
    pub deleted_chunks: Vec<Chunk>,
}

/// Awaitable handle for the background (vector/domain) indexing phase.
pub struct Phase2Task {
    handle: std::thread::JoinHandle<Vec<(String, IndexError)>>,
}

impl Phase2Task {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until phase 2 completes and return its errors.
    pub fn wait(self) -> Vec<(String, IndexError)> {
        match self.handle.join() {
            Ok(errors) => errors,
            Err(_) => vec![(
                "phase2_task".to_string(),
                IndexError::backend("phase2_task", "background indexing thread panicked"),
            )],
        }
    }
}

/// Result of two-phase indexing: phase 1 (symbol/lexical/fuzzy) is done when
/// this is returned; phase 2 (vector/domain) may still be running.
pub struct IndexingPhaseResult {
    pub phase1_completed: bool,
    pub phase2_task: Option<Phase2Task>,
    pub errors: Vec<(String, IndexError)>,
}

impl IndexingPhaseResult {
    pub fn is_fully_complete(&self) -> bool {
        match &self.phase2_task {
            Some(task) => self.phase1_completed && task.is_finished(),
            None => self.phase1_completed,
        }
    }
}

/// Outcome of `index_files`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalStatus {
    Success,
    PartialSuccess,
    Failed,
    NotTriggered,
}

#[derive(Debug)]
pub struct IncrementalIndexingResult {
    pub status: IncrementalStatus,
    pub indexed_count: usize,
    pub total_files: usize,
    /// (file_path, error message) per failed file.
    pub errors: Vec<(String, String)>,
}

impl IncrementalIndexingResult {
    fn not_triggered() -> Self {
        Self {
            status: IncrementalStatus::NotTriggered,
            indexed_count: 0,
            total_files: 0,
            errors: Vec::new(),
        }
    }
}

/// Simple in-memory `FileQueue`: batches are held until an external worker
/// drains them.
#[derive(Default)]
pub struct InMemoryFileQueue {
    batches: Mutex<VecDeque<QueuedFileBatch>>,
}

#[derive(Debug, Clone)]
pub struct QueuedFileBatch {
    pub repo_id: String,
    pub snapshot_id: String,
    pub file_paths: Vec<String>,
    pub reason: Option<String>,
    pub priority: i32,
}

impl InMemoryFileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop_batch(&self) -> Option<QueuedFileBatch> {
        self.batches.lock().expect("file queue lock poisoned").pop_front()
    }
}

impl FileQueue for InMemoryFileQueue {
    fn enqueue_batch(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        file_paths: &[String],
        reason: Option<&str>,
        priority: i32,
    ) -> usize {
        let mut batches = self.batches.lock().expect("file queue lock poisoned");
        batches.push_back(QueuedFileBatch {
            repo_id: repo_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            file_paths: file_paths.to_vec(),
            reason: reason.map(str::to_string),
            priority,
        });
        file_paths.len()
    }

    fn is_idle(&self, repo_id: &str, snapshot_id: &str) -> bool {
        let batches = self.batches.lock().expect("file queue lock poisoned");
        !batches
            .iter()
            .any(|b| b.repo_id == repo_id && b.snapshot_id == snapshot_id)
    }

    fn queue_size(&self) -> usize {
        self.batches.lock().expect("file queue lock poisoned").len()
    }
}

/// Orchestrates indexing and search across the configured index backends.
///
/// Every port is optional; missing ones are simply skipped. Per-backend
/// failures are accumulated as `(operation, error)` pairs and never abort
/// the other backends -- the only fatal path is a whole-batch transform
/// failure during full indexing. Indexes are independently consistent at
/// `(repo_id, snapshot_id)` granularity; no cross-index transactionality is
/// promised.
#[derive(Default)]
pub struct IndexingService {
    lexical: Option<Arc<dyn LexicalIndexPort>>,
    vector: Option<Arc<dyn VectorIndexPort>>,
    symbol: Option<Arc<dyn SymbolIndexPort>>,
    fuzzy: Option<Arc<dyn FuzzyIndexPort>>,
    domain: Option<Arc<dyn DomainMetaIndexPort>>,
    runtime: Option<Arc<dyn RuntimeIndexPort>>,
    file_queue: Option<Arc<dyn FileQueue>>,
    embedding_queue: Option<Arc<EmbeddingQueue>>,
    idempotency: Option<Arc<IdempotencyStore>>,
    single_file_indexer: Option<Arc<dyn SingleFileIndexer>>,
    delta_writer: Option<Arc<dyn DeltaWriter>>,
    repo_roots: Option<Arc<dyn RepoRootResolver>>,
    config: ServiceConfig,
}

impl IndexingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lexical(mut self, port: Arc<dyn LexicalIndexPort>) -> Self {
        self.lexical = Some(port);
        self
    }

    pub fn with_vector(mut self, port: Arc<dyn VectorIndexPort>) -> Self {
        self.vector = Some(port);
        self
    }

    pub fn with_symbol(mut self, port: Arc<dyn SymbolIndexPort>) -> Self {
        self.symbol = Some(port);
        self
    }

    pub fn with_fuzzy(mut self, port: Arc<dyn FuzzyIndexPort>) -> Self {
        self.fuzzy = Some(port);
        self
    }

    pub fn with_domain(mut self, port: Arc<dyn DomainMetaIndexPort>) -> Self {
        self.domain = Some(port);
        self
    }

    pub fn with_runtime(mut self, port: Arc<dyn RuntimeIndexPort>) -> Self {
        self.runtime = Some(port);
        self
    }

    pub fn with_file_queue(mut self, queue: Arc<dyn FileQueue>) -> Self {
        self.file_queue = Some(queue);
        self
    }

    pub fn with_embedding_queue(mut self, queue: Arc<EmbeddingQueue>) -> Self {
        self.embedding_queue = Some(queue);
        self
    }

    pub fn with_idempotency(mut self, store: Arc<IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn with_single_file_indexer(mut self, indexer: Arc<dyn SingleFileIndexer>) -> Self {
        self.single_file_indexer = Some(indexer);
        self
    }

    pub fn with_delta_writer(mut self, writer: Arc<dyn DeltaWriter>) -> Self {
        self.delta_writer = Some(writer);
        self
    }

    pub fn with_repo_roots(mut self, roots: Arc<dyn RepoRootResolver>) -> Self {
        self.repo_roots = Some(roots);
        self
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    // ------------------------------------------------------------------
    // Full / incremental / two-phase indexing
    // ------------------------------------------------------------------

    /// Full repository indexing across every configured index. Idempotent
    /// under fixed inputs. Returns the per-backend errors.
    #[tracing::instrument(skip_all, fields(repo_id, snapshot_id, chunks = chunks.len()))]
    pub fn index_repo_full(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        chunks: &[Chunk],
        graph_doc: Option<&GraphDocument>,
        repomap: Option<RepoMapSnapshot>,
        source_codes: Option<&HashMap<ChunkId, String>>,
    ) -> Result<Vec<(String, IndexError)>, IndexError> {
        let index_docs = self.transform_or_fail(repo_id, chunks, repomap, source_codes, snapshot_id)?;
        let mut errors: Vec<(String, IndexError)> = Vec::new();

        if let Some(vector) = &self.vector {
            safe_index_op("vector", repo_id, &mut errors, || {
                vector.index(repo_id, snapshot_id, &index_docs)
            });
        }
        if let Some(lexical) = &self.lexical {
            safe_index_op("lexical", repo_id, &mut errors, || {
                lexical.reindex_repo(repo_id, snapshot_id)
            });
        }
        if let (Some(symbol), Some(graph_doc)) = (&self.symbol, graph_doc) {
            safe_index_op("symbol", repo_id, &mut errors, || {
                symbol.index_graph(repo_id, snapshot_id, graph_doc)
            });
        }
        if let Some(fuzzy) = &self.fuzzy {
            safe_index_op("fuzzy", repo_id, &mut errors, || {
                fuzzy.index(repo_id, snapshot_id, &index_docs)
            });
        }
        if let Some(domain) = &self.domain {
            let domain_docs: Vec<IndexDocument> = index_docs
                .iter()
                .filter(|d| is_domain_doc(d))
                .cloned()
                .collect();
            if !domain_docs.is_empty() {
                safe_index_op("domain", repo_id, &mut errors, || {
                    domain.index(repo_id, snapshot_id, &domain_docs)
                });
            }
        }

        if !errors.is_empty() {
            let failed: Vec<&str> = errors.iter().map(|(name, _)| name.as_str()).collect();
            tracing::warn!(
                repo_id,
                failures = errors.len(),
                failed = ?failed,
                "full indexing completed with failures"
            );
        }
        Ok(errors)
    }

    /// Incremental indexing of changed chunks only.
    #[tracing::instrument(skip_all, fields(repo_id, snapshot_id))]
    pub fn index_repo_incremental(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        refresh: &ChunkRefreshResult,
        repomap: Option<RepoMapSnapshot>,
        source_codes: Option<&HashMap<ChunkId, String>>,
    ) -> Result<Vec<(String, IndexError)>, IndexError> {
        let mut errors: Vec<(String, IndexError)> = Vec::new();

        let changed_chunks: Vec<Chunk> = refresh
            .added_chunks
            .iter()
            .chain(refresh.updated_chunks.iter())
            .cloned()
            .collect();

        if !changed_chunks.is_empty() {
            let transformer = IndexDocumentTransformer::new(repomap, None);
            let index_docs = transformer.transform_batch(&changed_chunks, source_codes, snapshot_id);

            if let Some(vector) = &self.vector {
                safe_index_op("vector_upsert", repo_id, &mut errors, || {
                    vector.upsert(repo_id, snapshot_id, &index_docs)
                });
            }
            if let Some(fuzzy) = &self.fuzzy {
                safe_index_op("fuzzy_upsert", repo_id, &mut errors, || {
                    fuzzy.upsert(repo_id, snapshot_id, &index_docs)
                });
            }
            if let Some(domain) = &self.domain {
                let domain_docs: Vec<IndexDocument> = index_docs
                    .iter()
                    .filter(|d| is_domain_doc(d))
                    .cloned()
                    .collect();
                if !domain_docs.is_empty() {
                    safe_index_op("domain_upsert", repo_id, &mut errors, || {
                        domain.upsert(repo_id, snapshot_id, &domain_docs)
                    });
                }
            }
        }

        if !refresh.deleted_chunks.is_empty() {
            let deleted_ids: Vec<ChunkId> =
                refresh.deleted_chunks.iter().map(|c| c.id).collect();
            if let Some(vector) = &self.vector {
                safe_index_op("vector_delete", repo_id, &mut errors, || {
                    vector.delete(repo_id, snapshot_id, &deleted_ids)
                });
            }
            if let Some(fuzzy) = &self.fuzzy {
                safe_index_op("fuzzy_delete", repo_id, &mut errors, || {
                    fuzzy.delete(repo_id, snapshot_id, &deleted_ids)
                });
            }
            if let Some(domain) = &self.domain {
                safe_index_op("domain_delete", repo_id, &mut errors, || {
                    domain.delete(repo_id, snapshot_id, &deleted_ids)
                });
            }
        }

        if let Some(lexical) = &self.lexical {
            if !changed_chunks.is_empty() {
                let mut changed_files: Vec<String> =
                    changed_chunks.iter().map(|c| c.file_path.clone()).collect();
                changed_files.sort();
                changed_files.dedup();
                safe_index_op("lexical_update", repo_id, &mut errors, || {
                    lexical.reindex_paths(repo_id, snapshot_id, &changed_files)
                });
            }
        }

        if !errors.is_empty() {
            let failed: Vec<&str> = errors.iter().map(|(name, _)| name.as_str()).collect();
            tracing::warn!(
                repo_id,
                failures = errors.len(),
                failed = ?failed,
                "incremental indexing completed with failures"
            );
        }
        Ok(errors)
    }

    /// Two-phase indexing: fast core indexes synchronously (symbol, lexical,
    /// fuzzy), heavy embedding indexes (vector, domain) on a background
    /// thread. Callers can use search as soon as this returns and
    /// `wait_for_full_indexing` later.
    #[tracing::instrument(skip_all, fields(repo_id, snapshot_id, chunks = chunks.len()))]
    pub fn index_repo_two_phase(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        chunks: &[Chunk],
        graph_doc: Option<&GraphDocument>,
        repomap: Option<RepoMapSnapshot>,
        source_codes: Option<&HashMap<ChunkId, String>>,
    ) -> Result<IndexingPhaseResult, IndexError> {
        let index_docs =
            match self.transform_or_fail(repo_id, chunks, repomap, source_codes, snapshot_id) {
                Ok(docs) => docs,
                Err(e) => {
                    return Ok(IndexingPhaseResult {
                        phase1_completed: false,
                        phase2_task: None,
                        errors: vec![("transform".to_string(), e)],
                    })
                }
            };

        let mut errors: Vec<(String, IndexError)> = Vec::new();
        tracing::info!(repo_id, "phase 1 (fast core) indexing started");

        if let (Some(symbol), Some(graph_doc)) = (&self.symbol, graph_doc) {
            safe_index_op("symbol", repo_id, &mut errors, || {
                symbol.index_graph(repo_id, snapshot_id, graph_doc)
            });
        }
        if let Some(lexical) = &self.lexical {
            safe_index_op("lexical", repo_id, &mut errors, || {
                lexical.reindex_repo(repo_id, snapshot_id)
            });
        }
        if let Some(fuzzy) = &self.fuzzy {
            safe_index_op("fuzzy", repo_id, &mut errors, || {
                fuzzy.index(repo_id, snapshot_id, &index_docs)
            });
        }

        let phase1_completed = !errors
            .iter()
            .any(|(name, _)| matches!(name.as_str(), "symbol" | "lexical" | "fuzzy"));
        tracing::info!(repo_id, phase1_completed, "phase 1 completed");

        let phase2_task = if self.vector.is_some() || self.domain.is_some() {
            let vector = self.vector.clone();
            let domain = self.domain.clone();
            let repo_id = repo_id.to_string();
            let snapshot_id = snapshot_id.to_string();
            let docs = index_docs;
            let handle = std::thread::spawn(move || {
                let mut phase2_errors: Vec<(String, IndexError)> = Vec::new();
                tracing::info!(repo_id = %repo_id, "phase 2 (background) indexing started");

                if let Some(vector) = vector {
                    safe_index_op("vector", &repo_id, &mut phase2_errors, || {
                        vector.index(&repo_id, &snapshot_id, &docs)
                    });
                }
                if let Some(domain) = domain {
                    let domain_docs: Vec<IndexDocument> =
                        docs.iter().filter(|d| is_domain_doc(d)).cloned().collect();
                    if !domain_docs.is_empty() {
                        safe_index_op("domain", &repo_id, &mut phase2_errors, || {
                            domain.index(&repo_id, &snapshot_id, &domain_docs)
                        });
                    }
                }

                if phase2_errors.is_empty() {
                    tracing::info!(repo_id = %repo_id, "phase 2 completed");
                } else {
                    let failed: Vec<&str> =
                        phase2_errors.iter().map(|(n, _)| n.as_str()).collect();
                    tracing::warn!(repo_id = %repo_id, failed = ?failed, "phase 2 completed with errors");
                }
                phase2_errors
            });
            Some(Phase2Task { handle })
        } else {
            None
        };

        Ok(IndexingPhaseResult {
            phase1_completed,
            phase2_task,
            errors,
        })
    }

    /// Join the phase-2 task, folding its errors into the result. Returns
    /// whether both phases completed.
    pub fn wait_for_full_indexing(&self, result: &mut IndexingPhaseResult) -> bool {
        if let Some(task) = result.phase2_task.take() {
            let phase2_errors = task.wait();
            let panicked = phase2_errors
                .iter()
                .any(|(name, _)| name == "phase2_task");
            result.errors.extend(phase2_errors);
            if panicked {
                return false;
            }
        }
        result.phase1_completed
    }

    fn transform_or_fail(
        &self,
        repo_id: &str,
        chunks: &[Chunk],
        repomap: Option<RepoMapSnapshot>,
        source_codes: Option<&HashMap<ChunkId, String>>,
        snapshot_id: &str,
    ) -> Result<Vec<IndexDocument>, IndexError> {
        let transformer = IndexDocumentTransformer::new(repomap, None);
        let docs = transformer.transform_batch(chunks, source_codes, snapshot_id);
        if !chunks.is_empty() && docs.is_empty() {
            tracing::error!(repo_id, "transform produced no documents for a non-empty batch");
            return Err(IndexError::Transform {
                reason: format!("all {} chunks failed to transform", chunks.len()),
            });
        }
        Ok(docs)
    }

    // ------------------------------------------------------------------
    // Incremental file indexing (editor/agent save path)
    // ------------------------------------------------------------------

    /// Small-change indexing entry used by editor save hooks.
    ///
    /// Pipeline: normalize+filter → idempotency skip (when `head_sha` is
    /// given) → route (priority >= 1 always runs inline; otherwise large
    /// batches are queued) → per-file indexing with error collection →
    /// idempotency record for successes.
    #[tracing::instrument(skip(self, file_paths), fields(repo_id, snapshot_id, files = file_paths.len(), reason))]
    pub fn index_files(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        file_paths: &[String],
        reason: Option<&str>,
        priority: i32,
        head_sha: Option<&str>,
    ) -> Result<IncrementalIndexingResult, IndexError> {
        let repo_root = self.repo_roots.as_ref().and_then(|r| r.resolve(repo_id));
        let filter = FileFilter::new(repo_root);
        let mut paths = filter.normalize_and_filter(file_paths);

        if paths.is_empty() {
            tracing::info!(repo_id, original = file_paths.len(), "no files left after filtering");
            return Ok(IncrementalIndexingResult::not_triggered());
        }

        if let (Some(head_sha), Some(idempotency)) = (head_sha, &self.idempotency) {
            let (needs, already) =
                idempotency.filter_already_indexed(repo_id, snapshot_id, &paths, head_sha)?;
            if !already.is_empty() {
                tracing::info!(
                    repo_id,
                    head_sha = &head_sha[..head_sha.len().min(8)],
                    needs_indexing = needs.len(),
                    already_indexed = already.len(),
                    "idempotency filter applied"
                );
            }
            if needs.is_empty() {
                return Ok(IncrementalIndexingResult::not_triggered());
            }
            paths = needs;
        }

        tracing::info!(
            monotonic_counter.incremental_indexing_triggered_total = 1u64,
            repo_id,
            trigger_source = reason.unwrap_or("unknown")
        );

        // Priority >= 1 (agent) always runs inline; otherwise large batches
        // defer to the file queue when one is wired in.
        if priority < 1 && paths.len() > self.config.queue_threshold {
            if let Some(queue) = &self.file_queue {
                let accepted = queue.enqueue_batch(repo_id, snapshot_id, &paths, reason, priority);
                tracing::info!(
                    repo_id,
                    accepted,
                    queue_size = queue.queue_size(),
                    "files enqueued for indexing"
                );
                return Ok(IncrementalIndexingResult {
                    status: IncrementalStatus::Success,
                    indexed_count: accepted,
                    total_files: paths.len(),
                    errors: Vec::new(),
                });
            }
        }

        let mut indexed = Vec::new();
        let mut errors: Vec<(String, String)> = Vec::new();
        for path in &paths {
            match self.index_single_file(repo_id, snapshot_id, path) {
                Ok(()) => indexed.push(path.clone()),
                Err(e) => {
                    tracing::error!(repo_id, file_path = %path, error = %e, "file indexing failed");
                    errors.push((path.clone(), e.to_string()));
                }
            }
        }

        let status = if indexed.len() == paths.len() {
            IncrementalStatus::Success
        } else if indexed.is_empty() {
            IncrementalStatus::Failed
        } else {
            IncrementalStatus::PartialSuccess
        };

        if let (Some(head_sha), Some(idempotency)) = (head_sha, &self.idempotency) {
            for path in &indexed {
                if let Err(e) = idempotency.mark_indexed(repo_id, snapshot_id, path, head_sha) {
                    tracing::warn!(file_path = %path, error = %e, "idempotency record failed");
                }
            }
        }

        tracing::info!(
            repo_id,
            snapshot_id,
            ?status,
            indexed_count = indexed.len(),
            total_files = paths.len(),
            error_count = errors.len(),
            "incremental indexing completed"
        );
        Ok(IncrementalIndexingResult {
            status,
            indexed_count: indexed.len(),
            total_files: paths.len(),
            errors,
        })
    }

    /// Index one file: the full pipeline when an orchestrator is wired in,
    /// otherwise a lexical-delta-only write.
    fn index_single_file(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        file_path: &str,
    ) -> Result<(), IndexError> {
        if let Some(indexer) = &self.single_file_indexer {
            return indexer.index_file(repo_id, snapshot_id, file_path);
        }

        let Some(writer) = &self.delta_writer else {
            tracing::debug!(repo_id, file_path, "no indexing path configured, skipping");
            return Ok(());
        };
        let root = self
            .repo_roots
            .as_ref()
            .and_then(|r| r.resolve(repo_id))
            .ok_or_else(|| IndexError::RepoRootUnresolved {
                repo_id: repo_id.to_string(),
            })?;

        let abs = root.join(file_path);
        match std::fs::read_to_string(&abs) {
            Ok(content) => writer.index_file_delta(repo_id, file_path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                writer.delete_file_delta(repo_id, file_path)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the queues until they drain or `timeout` elapses. Backoff starts
    /// at 100 ms and grows 1.5x up to 1 s.
    pub fn wait_until_idle(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        timeout: Duration,
    ) -> Result<bool, IndexError> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(100);

        loop {
            let file_idle = self
                .file_queue
                .as_ref()
                .map_or(true, |q| q.is_idle(repo_id, snapshot_id));
            let embed_idle = match &self.embedding_queue {
                Some(q) => q.is_idle(repo_id, snapshot_id)?,
                None => true,
            };
            if file_idle && embed_idle {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                tracing::warn!(repo_id, ?timeout, "wait_until_idle timed out");
                return Ok(false);
            }
            std::thread::sleep(delay.min(timeout.saturating_sub(start.elapsed())));
            delay = (delay.mul_f32(1.5)).min(Duration::from_secs(1));
        }
    }

    // ------------------------------------------------------------------
    // Unified search
    // ------------------------------------------------------------------

    /// Fan out the query to every configured index and fuse the results
    /// with weighted scoring. Per-backend failures are logged and the fused
    /// list is computed over whatever did return.
    #[tracing::instrument(skip(self, query, weights), fields(repo_id, limit, result_count))]
    pub fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
        weights: Option<HashMap<SearchSource, f32>>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let weights = weights.unwrap_or_else(default_weights);
        let mut all_hits: Vec<SearchHit> = Vec::new();
        let mut failures: Vec<&'static str> = Vec::new();

        let mut collect =
            |name: &'static str,
             hits: Option<Result<Vec<SearchHit>, IndexError>>,
             all: &mut Vec<SearchHit>| {
                match hits {
                    Some(Ok(hits)) => {
                        tracing::debug!(backend = name, count = hits.len(), "backend returned");
                        all.extend(hits);
                    }
                    Some(Err(e)) => {
                        tracing::error!(backend = name, error = %e, "backend search failed");
                        failures.push(name);
                    }
                    None => {}
                }
            };

        collect(
            "lexical",
            self.lexical.as_ref().and_then(|p| {
                weights
                    .contains_key(&SearchSource::Lexical)
                    .then(|| p.search(repo_id, snapshot_id, query, BACKEND_POOL_SIZE))
            }),
            &mut all_hits,
        );
        collect(
            "vector",
            self.vector.as_ref().and_then(|p| {
                weights
                    .contains_key(&SearchSource::Vector)
                    .then(|| p.search(repo_id, snapshot_id, query, BACKEND_POOL_SIZE, None))
            }),
            &mut all_hits,
        );
        collect(
            "symbol",
            self.symbol.as_ref().and_then(|p| {
                weights
                    .contains_key(&SearchSource::Symbol)
                    .then(|| p.search(repo_id, snapshot_id, query, BACKEND_POOL_SIZE))
            }),
            &mut all_hits,
        );
        collect(
            "fuzzy",
            self.fuzzy.as_ref().and_then(|p| {
                weights
                    .contains_key(&SearchSource::Fuzzy)
                    .then(|| p.search(repo_id, snapshot_id, query, BACKEND_POOL_SIZE))
            }),
            &mut all_hits,
        );
        collect(
            "domain",
            self.domain.as_ref().and_then(|p| {
                weights
                    .contains_key(&SearchSource::Domain)
                    .then(|| p.search(repo_id, snapshot_id, query, BACKEND_POOL_SIZE))
            }),
            &mut all_hits,
        );
        collect(
            "runtime",
            self.runtime.as_ref().and_then(|p| {
                weights
                    .contains_key(&SearchSource::Runtime)
                    .then(|| p.search(repo_id, snapshot_id, query, BACKEND_POOL_SIZE))
            }),
            &mut all_hits,
        );

        if !failures.is_empty() {
            tracing::warn!(repo_id, ?failures, "search completed with backend failures");
        }
        if all_hits.is_empty() {
            tracing::Span::current().record("result_count", 0usize);
            return Ok(Vec::new());
        }

        let mut fused = fuse_hits(all_hits, &weights);
        fused.truncate(limit);
        tracing::Span::current().record("result_count", fused.len());
        Ok(fused)
    }
}

/// Group hits by chunk, weight-average the scores per group, and sort once.
///
/// Within a group the fused score is Σ(score·weight) / Σweight over the
/// sources present, so a chunk matched by a single strong source is not
/// diluted by sources that never saw it. The representative hit (first in
/// the group) supplies path, symbol, and metadata; multi-source groups
/// additionally record `sources` and `original_scores`.
pub fn fuse_hits(hits: Vec<SearchHit>, weights: &HashMap<SearchSource, f32>) -> Vec<SearchHit> {
    let mut order: Vec<ChunkId> = Vec::new();
    let mut groups: HashMap<ChunkId, Vec<SearchHit>> = HashMap::new();
    for hit in hits {
        let entry = groups.entry(hit.chunk_id).or_default();
        if entry.is_empty() {
            order.push(hit.chunk_id);
        }
        entry.push(hit);
    }

    let mut fused: Vec<SearchHit> = Vec::with_capacity(order.len());
    for chunk_id in order {
        let group = groups.remove(&chunk_id).expect("group exists for ordered id");
        let mut weighted_score = 0.0f32;
        let mut total_weight = 0.0f32;
        for hit in &group {
            let weight = weights.get(&hit.source).copied().unwrap_or(0.0);
            weighted_score += hit.score * weight;
            total_weight += weight;
        }
        let final_score = if total_weight > 0.0 {
            weighted_score / total_weight
        } else {
            0.0
        };

        let representative = &group[0];
        let metadata = if group.len() == 1 {
            representative.metadata.clone()
        } else {
            let mut metadata = representative.metadata.clone();
            metadata.sources = group.iter().map(|h| h.source).collect();
            metadata.original_scores = group.iter().map(|h| (h.source, h.score)).collect();
            metadata
        };

        fused.push(SearchHit {
            chunk_id,
            file_path: representative.file_path.clone(),
            symbol_id: representative.symbol_id.clone(),
            score: final_score,
            source: representative.source,
            metadata,
        });
    }

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused
}

fn safe_index_op<F>(
    operation: &str,
    repo_id: &str,
    errors: &mut Vec<(String, IndexError)>,
    op: F,
) where
    F: FnOnce() -> Result<(), IndexError>,
{
    match op() {
        Ok(()) => {
            tracing::info!(operation, repo_id, "index operation completed");
        }
        Err(e) => {
            tracing::error!(operation, repo_id, error = %e, "index operation failed");
            errors.push((operation.to_string(), e));
        }
    }
}
