//! End-to-end flows over the fully wired service: full/two-phase indexing,
//! merged lexical search, rank fusion, incremental file indexing, and
//! compaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use strata_core::{
    CallEdge, Chunk, ChunkId, ChunkKind, GraphDocument, GraphNode, ImportEdge, Language,
    SearchSource,
};
use strata_index::adapters::{
    DomainDocIndex, HashEmbedder, MergingLexicalIndex, SqliteSymbolIndex, TrigramFuzzyIndex,
    UsearchVectorIndex,
};
use strata_index::{
    CompactionManager, EmbeddingQueue, EmbeddingWorkerPool, IncrementalStatus, IndexingService,
    InMemoryFileQueue, StaticRepoRoots,
};
use strata_index::ports::{FileQueue, LexicalIndexPort, VectorIndexPort};
use strata_storage::delta::{open_delta_db_in_memory, DeltaLexicalStore};
use strata_storage::freeze::FreezeBuffer;
use strata_storage::fulltext::BaseLexicalStore;
use strata_storage::fuzzy::TrigramStore;
use strata_storage::graph::SymbolGraphStore;
use strata_storage::idempotency::IdempotencyStore;
use strata_storage::lock::RepoLockStore;
use strata_storage::queue::EmbeddingQueueStore;
use strata_storage::vector::VectorStore;

const DIM: usize = 64;
const REPO: &str = "demo-repo";
const SNAP: &str = "snap-1";

struct World {
    service: IndexingService,
    lexical: Arc<MergingLexicalIndex>,
    delta: Arc<DeltaLexicalStore>,
    freeze: Arc<FreezeBuffer>,
    vector: Arc<UsearchVectorIndex>,
    _tmp: tempfile::TempDir,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn write_repo_files(root: &Path) {
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(
        root.join("src/payments.py"),
        "def process_payment(amount):\n    validate_amount(amount)\n    return charge(amount)\n",
    )
    .unwrap();
    std::fs::write(
        root.join("src/validate.py"),
        "def validate_amount(amount):\n    return amount > 0\n",
    )
    .unwrap();
    std::fs::write(
        root.join("README.md"),
        "Payment processing service. Validates amounts and charges cards.\n",
    )
    .unwrap();
}

fn make_world() -> World {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    write_repo_files(tmp.path());
    let roots = Arc::new(StaticRepoRoots::new().with_root(REPO, tmp.path()));

    let conn = open_delta_db_in_memory().unwrap();
    let delta = Arc::new(DeltaLexicalStore::new(conn.clone()).unwrap());
    let freeze = Arc::new(FreezeBuffer::new(conn).unwrap());
    let lexical = Arc::new(MergingLexicalIndex::new(
        BaseLexicalStore::create_in_ram().unwrap(),
        delta.clone(),
        freeze.clone(),
        roots.clone(),
    ));

    let embedder = Arc::new(HashEmbedder::new(DIM));
    let vector = Arc::new(UsearchVectorIndex::new(
        VectorStore::new(DIM).unwrap(),
        embedder.clone(),
    ));
    let symbol = Arc::new(SqliteSymbolIndex::new(Arc::new(
        SymbolGraphStore::open_in_memory().unwrap(),
    )));
    let fuzzy = Arc::new(TrigramFuzzyIndex::new(Arc::new(
        TrigramStore::open_in_memory().unwrap(),
    )));
    let domain = Arc::new(DomainDocIndex::new(
        VectorStore::new(DIM).unwrap(),
        embedder,
    ));

    let service = IndexingService::new()
        .with_lexical(lexical.clone())
        .with_vector(vector.clone())
        .with_symbol(symbol)
        .with_fuzzy(fuzzy)
        .with_domain(domain)
        .with_idempotency(Arc::new(IdempotencyStore::open_in_memory().unwrap()))
        .with_delta_writer(lexical.clone())
        .with_repo_roots(roots);

    World {
        service,
        lexical,
        delta,
        freeze,
        vector,
        _tmp: tmp,
    }
}

fn chunk(id: u128, path: &str, symbol_id: &str, name: &str, sig: &str, content: &str) -> Chunk {
    Chunk {
        id: ChunkId(id),
        repo_id: REPO.into(),
        file_path: path.into(),
        kind: ChunkKind::Function,
        language: Language::Python,
        line_range: 0..3,
        symbol_id: Some(symbol_id.into()),
        symbol_name: Some(name.into()),
        content: content.into(),
        doc_comment: None,
        signature: Some(sig.into()),
        module: Some(path.trim_end_matches(".py").replace('/', ".")),
        visibility: Some("public".into()),
        parent_chunk_id: None,
        is_entrypoint: false,
        is_test: false,
    }
}

fn doc_chunk(id: u128, path: &str, content: &str) -> Chunk {
    Chunk {
        id: ChunkId(id),
        repo_id: REPO.into(),
        file_path: path.into(),
        kind: ChunkKind::Doc,
        language: Language::Markdown,
        line_range: 0..1,
        symbol_id: None,
        symbol_name: None,
        content: content.into(),
        doc_comment: None,
        signature: None,
        module: None,
        visibility: None,
        parent_chunk_id: None,
        is_entrypoint: false,
        is_test: false,
    }
}

fn sample_chunks() -> Vec<Chunk> {
    vec![
        chunk(
            1,
            "src/payments.py",
            "src.payments.process_payment",
            "process_payment",
            "(amount) -> Receipt",
            "def process_payment(amount):\n    validate_amount(amount)\n    return charge(amount)",
        ),
        chunk(
            2,
            "src/validate.py",
            "src.validate.validate_amount",
            "validate_amount",
            "(amount) -> bool",
            "def validate_amount(amount):\n    return amount > 0",
        ),
        doc_chunk(
            3,
            "README.md",
            "Payment processing service. Validates amounts and charges cards.",
        ),
    ]
}

fn sample_graph() -> GraphDocument {
    let node = |id: &str, name: &str, file: &str| GraphNode {
        symbol_id: id.to_string(),
        name: name.to_string(),
        fqn: id.to_string(),
        kind: Some("function".to_string()),
        file_path: file.to_string(),
        start_line: 0,
        end_line: 3,
        signature: None,
    };
    GraphDocument {
        nodes: vec![
            node("src.payments.process_payment", "process_payment", "src/payments.py"),
            node("src.validate.validate_amount", "validate_amount", "src/validate.py"),
        ],
        call_edges: vec![CallEdge {
            caller_id: "src.payments.process_payment".into(),
            callee_id: "src.validate.validate_amount".into(),
        }],
        import_edges: vec![ImportEdge {
            importer_path: "src/payments.py".into(),
            module: "src.validate".into(),
        }],
    }
}

fn only(source: SearchSource) -> HashMap<SearchSource, f32> {
    [(source, 1.0)].into_iter().collect()
}

#[test]
fn full_index_then_unified_search() {
    let world = make_world();
    let graph = sample_graph();
    let errors = world
        .service
        .index_repo_full(REPO, SNAP, &sample_chunks(), Some(&graph), None, None)
        .unwrap();
    assert!(errors.is_empty(), "unexpected backend errors: {errors:?}");

    let hits = world
        .service
        .search(REPO, SNAP, "validate_amount", 10, None)
        .unwrap();
    assert!(!hits.is_empty());
    // Sorted descending.
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    // The validator function is the strongest match; the chunk seen by both
    // vector and fuzzy fused into a multi-source hit.
    let top = &hits[0];
    assert_eq!(top.file_path.as_deref(), Some("src/validate.py"));
    assert!(
        hits.iter().any(|h| h.metadata.sources.len() >= 2),
        "expected at least one fused multi-source hit"
    );
}

#[test]
fn full_index_is_idempotent() {
    let world = make_world();
    let graph = sample_graph();
    for _ in 0..2 {
        let errors = world
            .service
            .index_repo_full(REPO, SNAP, &sample_chunks(), Some(&graph), None, None)
            .unwrap();
        assert!(errors.is_empty());
    }

    let symbol_hits = world
        .service
        .search(REPO, SNAP, "process_payment", 10, Some(only(SearchSource::Symbol)))
        .unwrap();
    assert_eq!(symbol_hits.len(), 1);

    let vector_hits = world
        .service
        .search(REPO, SNAP, "validate amounts", 10, Some(only(SearchSource::Vector)))
        .unwrap();
    assert_eq!(vector_hits.len(), 3);
}

#[test]
fn two_phase_core_first_then_background() {
    let world = make_world();
    let graph = sample_graph();
    let mut result = world
        .service
        .index_repo_two_phase(REPO, SNAP, &sample_chunks(), Some(&graph), None, None)
        .unwrap();

    // Phase 1 done synchronously: symbol search answers immediately.
    assert!(result.phase1_completed);
    assert!(result.phase2_task.is_some());
    let symbol_hits = world
        .service
        .search(REPO, SNAP, "callers of validate_amount", 10, Some(only(SearchSource::Symbol)))
        .unwrap();
    assert_eq!(symbol_hits.len(), 1);
    assert_eq!(
        symbol_hits[0].symbol_id.as_deref(),
        Some("src.payments.process_payment")
    );

    let lexical_hits = world
        .service
        .search(REPO, SNAP, "charge", 10, Some(only(SearchSource::Lexical)))
        .unwrap();
    assert!(!lexical_hits.is_empty());

    // After awaiting phase 2, vector and domain answer too.
    assert!(world.service.wait_for_full_indexing(&mut result));
    assert!(result.is_fully_complete());
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);

    let vector_hits = world
        .service
        .search(REPO, SNAP, "validate amounts", 10, Some(only(SearchSource::Vector)))
        .unwrap();
    assert!(!vector_hits.is_empty());

    let domain_hits = world
        .service
        .search(REPO, SNAP, "payment documentation", 10, Some(only(SearchSource::Domain)))
        .unwrap();
    assert!(!domain_hits.is_empty());
    assert_eq!(domain_hits[0].file_path.as_deref(), Some("README.md"));
}

#[test]
fn delta_overrides_base_in_lexical_search() {
    let world = make_world();
    world.lexical.reindex_repo(REPO, SNAP).unwrap();

    // Editor save: the working copy of payments.py changes.
    world
        .lexical
        .index_file_delta(
            REPO,
            "src/payments.py",
            "def process_payment(amount, currency):\n    return charge(amount, currency)\n",
        )
        .unwrap();

    let hits = world
        .service
        .search(REPO, SNAP, "process_payment", 10, Some(only(SearchSource::Lexical)))
        .unwrap();
    let payment_hits: Vec<_> = hits
        .iter()
        .filter(|h| h.file_path.as_deref() == Some("src/payments.py"))
        .collect();
    assert_eq!(payment_hits.len(), 1);
    assert_eq!(
        payment_hits[0].metadata.extra.get("layer").map(String::as_str),
        Some("delta")
    );
}

#[test]
fn index_files_same_head_sha_is_noop_second_time() {
    let world = make_world();
    let paths = vec!["src/payments.py".to_string(), "src/validate.py".to_string()];

    let first = world
        .service
        .index_files(REPO, SNAP, &paths, Some("editor_save"), 0, Some("abc123"))
        .unwrap();
    assert_eq!(first.status, IncrementalStatus::Success);
    assert_eq!(first.indexed_count, 2);
    assert_eq!(world.delta.count(REPO).unwrap(), 2);

    let second = world
        .service
        .index_files(REPO, SNAP, &paths, Some("editor_save"), 0, Some("abc123"))
        .unwrap();
    assert_eq!(second.status, IncrementalStatus::NotTriggered);
    assert_eq!(second.indexed_count, 0);

    // A new head SHA indexes again.
    let third = world
        .service
        .index_files(REPO, SNAP, &paths, Some("editor_save"), 0, Some("def456"))
        .unwrap();
    assert_eq!(third.status, IncrementalStatus::Success);
}

#[test]
fn index_files_filters_everything_not_triggered() {
    let world = make_world();
    let result = world
        .service
        .index_files(
            REPO,
            SNAP,
            &["node_modules/x.js".to_string(), "logo.png".to_string()],
            None,
            0,
            None,
        )
        .unwrap();
    assert_eq!(result.status, IncrementalStatus::NotTriggered);
}

#[test]
fn index_files_routes_large_low_priority_batches_to_queue() {
    let tmp = tempfile::tempdir().unwrap();
    write_repo_files(tmp.path());
    for i in 0..15 {
        std::fs::write(tmp.path().join(format!("f{i}.py")), "x = 1").unwrap();
    }
    let roots = Arc::new(StaticRepoRoots::new().with_root(REPO, tmp.path()));

    let conn = open_delta_db_in_memory().unwrap();
    let delta = Arc::new(DeltaLexicalStore::new(conn.clone()).unwrap());
    let lexical = Arc::new(MergingLexicalIndex::new(
        BaseLexicalStore::create_in_ram().unwrap(),
        delta.clone(),
        Arc::new(FreezeBuffer::new(conn).unwrap()),
        roots.clone(),
    ));
    let queue = Arc::new(InMemoryFileQueue::new());
    let service = IndexingService::new()
        .with_delta_writer(lexical)
        .with_repo_roots(roots)
        .with_file_queue(queue.clone());

    let paths: Vec<String> = (0..15).map(|i| format!("f{i}.py")).collect();

    // Low priority + large batch: accepted into the queue, nothing indexed
    // inline.
    let queued = service
        .index_files(REPO, SNAP, &paths, Some("bulk"), 0, None)
        .unwrap();
    assert_eq!(queued.status, IncrementalStatus::Success);
    assert_eq!(queue.queue_size(), 1);
    assert_eq!(delta.count(REPO).unwrap(), 0);

    // Agent priority always runs inline.
    let inline = service
        .index_files(REPO, SNAP, &paths, Some("agent"), 1, None)
        .unwrap();
    assert_eq!(inline.status, IncrementalStatus::Success);
    assert_eq!(delta.count(REPO).unwrap(), 15);
    assert_eq!(queue.queue_size(), 1);
}

#[test]
fn compaction_folds_delta_into_base_and_drops_tombstones() {
    let world = make_world();
    world.lexical.reindex_repo(REPO, SNAP).unwrap();

    // An edited file and a deleted file accumulate in the delta.
    let root = world._tmp.path();
    std::fs::write(
        root.join("src/payments.py"),
        "def process_payment_v2(amount):\n    return charge(amount)\n",
    )
    .unwrap();
    world
        .lexical
        .index_file_delta(REPO, "src/payments.py", "def process_payment_v2(amount):\n    return charge(amount)\n")
        .unwrap();
    std::fs::remove_file(root.join("src/validate.py")).unwrap();
    world.lexical.delete_file_delta(REPO, "src/validate.py").unwrap();

    let manager = CompactionManager::new(
        world.delta.clone(),
        world.freeze.clone(),
        world.lexical.clone(),
        Arc::new(RepoLockStore::open_in_memory(30).unwrap()),
    )
    .with_triggers(1, Duration::from_secs(24 * 3600));

    assert!(manager.should_compact(REPO).unwrap());
    assert!(manager.compact(REPO, SNAP).unwrap());

    // Delta content now lives in the rebuilt base; the delta is empty.
    assert_eq!(world.delta.count(REPO).unwrap(), 0);
    assert!(world.delta.tombstones().paths_for_repo(REPO).unwrap().is_empty());

    let hits = world
        .service
        .search(REPO, SNAP, "process_payment_v2", 10, Some(only(SearchSource::Lexical)))
        .unwrap();
    let payment_hit = hits
        .iter()
        .find(|h| h.file_path.as_deref() == Some("src/payments.py"))
        .expect("rebuilt base should serve the edited file");
    assert_eq!(
        payment_hit.metadata.extra.get("layer").map(String::as_str),
        Some("base")
    );

    // The deleted file is gone from the rebuilt base.
    let gone = world
        .service
        .search(REPO, SNAP, "validate_amount", 10, Some(only(SearchSource::Lexical)))
        .unwrap();
    assert!(gone.iter().all(|h| h.file_path.as_deref() != Some("src/validate.py")));
}

#[test]
fn embedding_queue_drains_and_service_reports_idle() {
    let world = make_world();

    let store = Arc::new(EmbeddingQueueStore::open_in_memory().unwrap());
    let queue = Arc::new(EmbeddingQueue::new(
        store,
        world.vector.clone() as Arc<dyn VectorIndexPort>,
        3,
    ));
    let pool = EmbeddingWorkerPool::new(2);
    pool.start(queue.clone());

    let service = IndexingService::new()
        .with_vector(world.vector.clone())
        .with_embedding_queue(queue.clone());

    let transformer = strata_index::IndexDocumentTransformer::new(None, None);
    let docs = transformer.transform_batch(&sample_chunks(), None, SNAP);
    queue.enqueue(&docs, 1).unwrap();

    assert!(service
        .wait_until_idle(REPO, SNAP, Duration::from_secs(10))
        .unwrap());
    pool.stop();
    assert_eq!(pool.stats().processed, 3);

    let hits = service
        .search(REPO, SNAP, "validate amounts", 10, Some(only(SearchSource::Vector)))
        .unwrap();
    assert!(!hits.is_empty());
}
