use std::sync::{Arc, Mutex};

use strata_core::{ChunkId, GraphDocument, GraphNode, HitMetadata, SearchHit, SearchSource};
use strata_overlay::{BaseGraphSource, OverlayError};
use strata_storage::graph::SymbolGraphStore;
use strata_storage::vector::VectorStore;

use crate::error::IndexError;
use crate::ports::{EmbeddingProvider, SymbolIndexPort};

/// Routed query intent for the symbol index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    Callers,
    Callees,
    References,
    Imports,
    Symbol,
}

impl QueryIntent {
    fn name(self) -> &'static str {
        match self {
            Self::Callers => "callers",
            Self::Callees => "callees",
            Self::References => "references",
            Self::Imports => "imports",
            Self::Symbol => "symbol",
        }
    }
}

const CALLERS_PATTERNS: &[&str] = &[
    "callers of ",
    "functions that call ",
    "who calls ",
    "what calls ",
];
const CALLEES_PATTERNS: &[&str] = &[
    "callees of ",
    "functions called by ",
    "called by ",
];
const REFERENCES_PATTERNS: &[&str] = &[
    "references to ",
    "usages of ",
    "uses of ",
];
const IMPORTS_PATTERNS: &[&str] = &[
    "files importing ",
    "who imports ",
    "what imports ",
    "imports ",
];

/// Classify a query into a graph intent and extract its target symbol.
///
/// Patterns are English keyword lists; non-English phrasing falls back to
/// plain symbol search.
pub fn analyze_query_intent(query: &str) -> (QueryIntent, Option<String>) {
    let lower = query.to_lowercase();
    let routes = [
        (QueryIntent::Callers, CALLERS_PATTERNS),
        (QueryIntent::Callees, CALLEES_PATTERNS),
        (QueryIntent::References, REFERENCES_PATTERNS),
        (QueryIntent::Imports, IMPORTS_PATTERNS),
    ];
    for (intent, patterns) in routes {
        for pattern in patterns {
            if let Some(idx) = lower.find(pattern) {
                // Offsets from the lowercased text are only safe on the
                // original when lowercasing kept byte lengths; bail to the
                // fallback otherwise.
                let Some(rest) = query.get(idx + pattern.len()..) else { continue };
                let target = rest
                    .trim()
                    .trim_matches(|c: char| c == '?' || c == '"' || c == '\'' || c == '`' || c == '.')
                    .to_string();
                if !target.is_empty() {
                    return (intent, Some(target));
                }
            }
        }
    }
    (QueryIntent::Symbol, None)
}

const QUESTION_WORDS: &[&str] = &["how", "what", "where", "why", "which", "when"];
const DESCRIPTIVE_VERBS: &[&str] = &[
    "handle", "handles", "parse", "parses", "validate", "validates", "process",
    "processes", "manage", "manages", "compute", "computes", "convert", "converts",
];

/// Whether a query reads like a natural-language description rather than a
/// symbol name: multiple words, question words, or descriptive verbs.
pub fn is_semantic_query(query: &str) -> bool {
    let words: Vec<&str> = query.split_whitespace().collect();
    if words.len() >= 4 {
        return true;
    }
    if words.len() >= 2 {
        let lower: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
        if lower.iter().any(|w| QUESTION_WORDS.contains(&w.as_str())) {
            return true;
        }
        if lower.iter().any(|w| DESCRIPTIVE_VERBS.contains(&w.as_str())) {
            return true;
        }
    }
    false
}

/// Symbol index over the SQLite graph store with intent-routed queries.
///
/// When an embedding provider is bound, natural-language queries are
/// answered from a symbol-embedding collection instead of substring match.
pub struct SqliteSymbolIndex {
    store: Arc<SymbolGraphStore>,
    semantic: Option<SemanticLayer>,
}

struct SemanticLayer {
    vectors: Mutex<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SqliteSymbolIndex {
    pub fn new(store: Arc<SymbolGraphStore>) -> Self {
        Self {
            store,
            semantic: None,
        }
    }

    /// Bind a symbol-embedding collection for semantic queries.
    pub fn with_embedder(
        mut self,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, IndexError> {
        let dimension = embedder.dimension();
        self.semantic = Some(SemanticLayer {
            vectors: Mutex::new(VectorStore::new(dimension)?),
            embedder,
        });
        Ok(self)
    }

    fn node_to_hit(
        repo_id: &str,
        node: GraphNode,
        score: f32,
        intent: QueryIntent,
        edge_type: Option<&str>,
    ) -> SearchHit {
        SearchHit {
            chunk_id: ChunkId::for_symbol(repo_id, &node.symbol_id),
            file_path: Some(node.file_path),
            symbol_id: Some(node.symbol_id),
            score,
            source: SearchSource::Symbol,
            metadata: HitMetadata {
                kind: node.kind,
                intent: Some(intent.name().to_string()),
                edge_type: edge_type.map(str::to_string),
                ..Default::default()
            },
        }
    }

    /// Rank-decayed score for substring matches; exact name/FQN match is 1.0.
    fn fallback_score(node: &GraphNode, query: &str, rank: usize) -> f32 {
        if node.name == query || node.fqn == query {
            1.0
        } else {
            (0.9 - 0.05 * rank as f32).max(0.5)
        }
    }

    fn semantic_search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Option<Vec<SearchHit>>, IndexError> {
        let Some(layer) = &self.semantic else {
            return Ok(None);
        };
        let query_vec = layer.embedder.embed(query)?;
        let vectors = layer.vectors.lock().expect("symbol vectors lock poisoned");
        let hits = vectors.search_knn(repo_id, snapshot_id, &query_vec, limit, None)?;
        Ok(Some(
            hits.into_iter()
                .map(|h| SearchHit {
                    chunk_id: h.chunk_id,
                    file_path: Some(h.file_path),
                    symbol_id: h.symbol_id,
                    score: 1.0 / (1.0 + h.distance.max(0.0)),
                    source: SearchSource::Symbol,
                    metadata: HitMetadata {
                        distance: Some(h.distance),
                        intent: Some("semantic".to_string()),
                        ..Default::default()
                    },
                })
                .collect(),
        ))
    }
}

impl SymbolIndexPort for SqliteSymbolIndex {
    fn index_graph(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        graph_doc: &GraphDocument,
    ) -> Result<(), IndexError> {
        self.store.index_graph(repo_id, snapshot_id, graph_doc, 1000)?;

        if let Some(layer) = &self.semantic {
            let mut vectors = layer.vectors.lock().expect("symbol vectors lock poisoned");
            vectors.delete_collection(repo_id, snapshot_id)?;
            for node in &graph_doc.nodes {
                let text = format!(
                    "{} {} {}",
                    node.name,
                    node.fqn,
                    node.signature.as_deref().unwrap_or("")
                );
                let vector = layer.embedder.embed(&text)?;
                vectors.add_vector(
                    repo_id,
                    snapshot_id,
                    ChunkId::for_symbol(repo_id, &node.symbol_id),
                    &node.file_path,
                    Some(&node.symbol_id),
                    &vector,
                )?;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, query), fields(intent))]
    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let (intent, target) = analyze_query_intent(query);
        tracing::Span::current().record("intent", intent.name());

        match (intent, target) {
            (QueryIntent::Callers, Some(target)) => {
                self.get_callers(repo_id, snapshot_id, &target, limit)
            }
            (QueryIntent::Callees, Some(target)) => {
                self.get_callees(repo_id, snapshot_id, &target, limit)
            }
            (QueryIntent::References, Some(target)) => {
                self.get_references(repo_id, snapshot_id, &target, limit)
            }
            (QueryIntent::Imports, Some(target)) => {
                let edges = self.store.get_importers(repo_id, snapshot_id, &target, limit)?;
                Ok(edges
                    .into_iter()
                    .map(|e| SearchHit {
                        chunk_id: ChunkId::virtual_for_file(repo_id, &e.importer_path),
                        file_path: Some(e.importer_path),
                        symbol_id: None,
                        score: 1.0,
                        source: SearchSource::Symbol,
                        metadata: HitMetadata {
                            intent: Some("imports".to_string()),
                            edge_type: Some("imports".to_string()),
                            mapped: Some(false),
                            ..Default::default()
                        },
                    })
                    .collect())
            }
            _ => {
                if is_semantic_query(query) {
                    if let Some(hits) =
                        self.semantic_search(repo_id, snapshot_id, query, limit)?
                    {
                        return Ok(hits);
                    }
                }
                // Name/FQN substring fallback, prefix matches first.
                let mut nodes =
                    self.store.find_nodes_by_prefix(repo_id, snapshot_id, query, limit)?;
                if nodes.len() < limit {
                    let have: std::collections::HashSet<String> =
                        nodes.iter().map(|n| n.symbol_id.clone()).collect();
                    for node in self.store.search_nodes(repo_id, snapshot_id, query, limit)? {
                        if nodes.len() >= limit {
                            break;
                        }
                        if !have.contains(&node.symbol_id) {
                            nodes.push(node);
                        }
                    }
                }
                Ok(nodes
                    .into_iter()
                    .enumerate()
                    .map(|(rank, node)| {
                        let score = Self::fallback_score(&node, query, rank);
                        Self::node_to_hit(repo_id, node, score, QueryIntent::Symbol, None)
                    })
                    .collect())
            }
        }
    }

    fn get_callers(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let nodes = self.store.get_callers(repo_id, snapshot_id, symbol, limit)?;
        Ok(nodes
            .into_iter()
            .map(|n| Self::node_to_hit(repo_id, n, 1.0, QueryIntent::Callers, Some("calls")))
            .collect())
    }

    fn get_callees(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let nodes = self.store.get_callees(repo_id, snapshot_id, symbol, limit)?;
        Ok(nodes
            .into_iter()
            .map(|n| Self::node_to_hit(repo_id, n, 1.0, QueryIntent::Callees, Some("calls")))
            .collect())
    }

    /// References: incoming call edges plus importers of the symbol.
    fn get_references(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let mut hits: Vec<SearchHit> = self
            .store
            .get_callers(repo_id, snapshot_id, symbol, limit)?
            .into_iter()
            .map(|n| Self::node_to_hit(repo_id, n, 1.0, QueryIntent::References, Some("calls")))
            .collect();

        for edge in self.store.get_importers(repo_id, snapshot_id, symbol, limit)? {
            if hits.len() >= limit {
                break;
            }
            hits.push(SearchHit {
                chunk_id: ChunkId::virtual_for_file(repo_id, &edge.importer_path),
                file_path: Some(edge.importer_path),
                symbol_id: None,
                score: 1.0,
                source: SearchSource::Symbol,
                metadata: HitMetadata {
                    intent: Some("references".to_string()),
                    edge_type: Some("imports".to_string()),
                    mapped: Some(false),
                    ..Default::default()
                },
            });
        }
        hits.truncate(limit);
        Ok(hits)
    }

    fn get_node_by_id(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol_id: &str,
    ) -> Result<Option<GraphNode>, IndexError> {
        Ok(self.store.get_node(repo_id, snapshot_id, symbol_id)?)
    }

    fn delete_repo(&self, repo_id: &str, snapshot_id: &str) -> Result<(), IndexError> {
        self.store.delete_snapshot(repo_id, snapshot_id)?;
        if let Some(layer) = &self.semantic {
            let mut vectors = layer.vectors.lock().expect("symbol vectors lock poisoned");
            vectors.delete_collection(repo_id, snapshot_id)?;
        }
        Ok(())
    }
}

/// Exposes the committed symbol graph to the overlay merger.
pub struct GraphStoreSource(pub Arc<SymbolGraphStore>);

impl BaseGraphSource for GraphStoreSource {
    fn call_edges(
        &self,
        repo_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<(String, String)>, OverlayError> {
        self.0
            .call_edges(repo_id, snapshot_id)
            .map(|edges| edges.into_iter().map(|e| (e.caller_id, e.callee_id)).collect())
            .map_err(|e| OverlayError::GraphSource(e.to_string()))
    }

    fn import_edges(
        &self,
        repo_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<(String, String)>, OverlayError> {
        self.0
            .import_edges(repo_id, snapshot_id)
            .map(|edges| {
                edges
                    .into_iter()
                    .map(|e| (e.importer_path, e.module))
                    .collect()
            })
            .map_err(|e| OverlayError::GraphSource(e.to_string()))
    }

    fn symbol_file(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol_id: &str,
    ) -> Result<Option<String>, OverlayError> {
        self.0
            .get_node(repo_id, snapshot_id, symbol_id)
            .map(|node| node.map(|n| n.file_path))
            .map_err(|e| OverlayError::GraphSource(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::vector::HashEmbedder;
    use strata_core::{CallEdge, ImportEdge};

    fn node(id: &str, name: &str, file: &str) -> GraphNode {
        GraphNode {
            symbol_id: id.to_string(),
            name: name.to_string(),
            fqn: id.to_string(),
            kind: Some("function".to_string()),
            file_path: file.to_string(),
            start_line: 0,
            end_line: 5,
            signature: Some(format!("def {name}()")),
        }
    }

    fn sample_graph() -> GraphDocument {
        GraphDocument {
            nodes: vec![
                node("app.main", "main", "src/app.py"),
                node("app.save_user", "save_user", "src/app.py"),
                node("db.insert", "insert", "src/db.py"),
            ],
            call_edges: vec![
                CallEdge { caller_id: "app.main".into(), callee_id: "app.save_user".into() },
                CallEdge { caller_id: "app.save_user".into(), callee_id: "db.insert".into() },
            ],
            import_edges: vec![ImportEdge {
                importer_path: "src/app.py".into(),
                module: "db".into(),
            }],
        }
    }

    fn index() -> SqliteSymbolIndex {
        let store = Arc::new(SymbolGraphStore::open_in_memory().unwrap());
        let idx = SqliteSymbolIndex::new(store);
        idx.index_graph("r1", "s1", &sample_graph()).unwrap();
        idx
    }

    #[test]
    fn intent_extraction() {
        assert_eq!(
            analyze_query_intent("callers of save_user"),
            (QueryIntent::Callers, Some("save_user".to_string()))
        );
        assert_eq!(
            analyze_query_intent("functions that call save_user?"),
            (QueryIntent::Callers, Some("save_user".to_string()))
        );
        assert_eq!(
            analyze_query_intent("callees of main"),
            (QueryIntent::Callees, Some("main".to_string()))
        );
        assert_eq!(
            analyze_query_intent("references to db.insert"),
            (QueryIntent::References, Some("db.insert".to_string()))
        );
        assert_eq!(
            analyze_query_intent("who imports db"),
            (QueryIntent::Imports, Some("db".to_string()))
        );
        assert_eq!(analyze_query_intent("save_user"), (QueryIntent::Symbol, None));
    }

    #[test]
    fn semantic_classifier() {
        assert!(is_semantic_query("how does the indexer work"));
        assert!(is_semantic_query("what handles retries"));
        assert!(is_semantic_query("parse config"));
        assert!(!is_semantic_query("save_user"));
        assert!(!is_semantic_query("db.insert"));
    }

    #[test]
    fn callers_query_routes_to_graph() {
        let idx = index();
        let hits = idx.search("r1", "s1", "callers of save_user", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol_id.as_deref(), Some("app.main"));
        assert_eq!(hits[0].metadata.intent.as_deref(), Some("callers"));
        assert_eq!(hits[0].metadata.edge_type.as_deref(), Some("calls"));
    }

    #[test]
    fn callees_query_routes_to_graph() {
        let idx = index();
        let hits = idx.search("r1", "s1", "callees of save_user", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].symbol_id.as_deref(), Some("db.insert"));
    }

    #[test]
    fn imports_query_returns_importing_files() {
        let idx = index();
        let hits = idx.search("r1", "s1", "who imports db", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path.as_deref(), Some("src/app.py"));
        assert_eq!(hits[0].metadata.mapped, Some(false));
    }

    #[test]
    fn plain_name_falls_back_to_substring_search() {
        let idx = index();
        let hits = idx.search("r1", "s1", "save_user", 10).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].symbol_id.as_deref(), Some("app.save_user"));
        assert!((hits[0].score - 1.0).abs() < f32::EPSILON);
        assert!(hits.iter().all(|h| h.score >= 0.5 && h.score <= 1.0));
    }

    #[test]
    fn semantic_query_uses_embedding_collection() {
        let store = Arc::new(SymbolGraphStore::open_in_memory().unwrap());
        let idx = SqliteSymbolIndex::new(store)
            .with_embedder(Arc::new(HashEmbedder::new(64)))
            .unwrap();
        idx.index_graph("r1", "s1", &sample_graph()).unwrap();

        let hits = idx
            .search("r1", "s1", "which function saves the user record", 5)
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].metadata.intent.as_deref(), Some("semantic"));
    }

    #[test]
    fn references_include_callers_and_importers() {
        let idx = index();
        let hits = idx.get_references("r1", "s1", "db", 10).unwrap();
        // app.save_user calls db.insert; src/app.py imports db.
        assert!(hits.iter().any(|h| h.symbol_id.as_deref() == Some("app.save_user")));
        assert!(hits
            .iter()
            .any(|h| h.metadata.edge_type.as_deref() == Some("imports")));
    }

    #[test]
    fn graph_source_exposes_edges() {
        let store = Arc::new(SymbolGraphStore::open_in_memory().unwrap());
        let idx = SqliteSymbolIndex::new(store.clone());
        idx.index_graph("r1", "s1", &sample_graph()).unwrap();

        let source = GraphStoreSource(store);
        let calls = source.call_edges("r1", "s1").unwrap();
        assert_eq!(calls.len(), 2);
        let imports = source.import_edges("r1", "s1").unwrap();
        assert_eq!(imports, vec![("src/app.py".to_string(), "db".to_string())]);
    }
}
