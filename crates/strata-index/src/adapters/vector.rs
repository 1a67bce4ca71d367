use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use strata_core::{ChunkId, HitMetadata, IndexDocument, SearchHit, SearchSource};
use strata_storage::vector::VectorStore;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::IndexError;
use crate::ports::{DomainMetaIndexPort, EmbeddingProvider, VectorIndexPort};

/// Deterministic feature-hashing embedder.
///
/// Tokenizes on non-alphanumerics, hashes each token into one of
/// `dimension` buckets, and L2-normalizes the counts. No model, no I/O:
/// useful as an offline fallback and in tests. Similar texts share tokens
/// and therefore buckets, so cosine distance is still meaningful.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (xxh3_64(token.to_lowercase().as_bytes()) as usize) % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Embedding-backed document index shared by the vector and domain adapters:
/// embeds `IndexDocument.content` on write and the query text on search.
pub struct EmbeddingIndex {
    store: Mutex<VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingIndex {
    pub fn new(store: VectorStore, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            store: Mutex::new(store),
            embedder,
        }
    }

    fn upsert_docs(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        let mut store = self.store.lock().expect("vector store lock poisoned");
        for doc in docs {
            let vector = self.embedder.embed(&doc.content)?;
            store.add_vector(
                repo_id,
                snapshot_id,
                doc.id,
                &doc.file_path,
                doc.symbol_id.as_deref(),
                &vector,
            )?;
        }
        Ok(())
    }

    fn replace_collection(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        {
            let mut store = self.store.lock().expect("vector store lock poisoned");
            store.delete_collection(repo_id, snapshot_id)?;
        }
        self.upsert_docs(repo_id, snapshot_id, docs)
    }

    fn delete_ids(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        ids: &[ChunkId],
    ) -> Result<(), IndexError> {
        let mut store = self.store.lock().expect("vector store lock poisoned");
        for id in ids {
            store.remove_vector(repo_id, snapshot_id, *id)?;
        }
        Ok(())
    }

    fn search_docs(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
        candidates: Option<&HashSet<ChunkId>>,
        source: SearchSource,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let query_vec = self.embedder.embed(query)?;
        let store = self.store.lock().expect("vector store lock poisoned");
        let hits = store.search_knn(repo_id, snapshot_id, &query_vec, limit, candidates)?;
        Ok(hits
            .into_iter()
            .map(|h| SearchHit {
                chunk_id: h.chunk_id,
                file_path: Some(h.file_path),
                symbol_id: h.symbol_id,
                // Cosine distance in [0, 2] mapped onto a (0, 1] score.
                score: 1.0 / (1.0 + h.distance.max(0.0)),
                source,
                metadata: HitMetadata {
                    distance: Some(h.distance),
                    ..Default::default()
                },
            })
            .collect())
    }
}

/// `VectorIndexPort` over the embedding index.
pub struct UsearchVectorIndex {
    inner: EmbeddingIndex,
}

impl UsearchVectorIndex {
    pub fn new(store: VectorStore, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            inner: EmbeddingIndex::new(store, embedder),
        }
    }
}

impl VectorIndexPort for UsearchVectorIndex {
    fn index(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        self.inner.replace_collection(repo_id, snapshot_id, docs)
    }

    fn upsert(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        self.inner.upsert_docs(repo_id, snapshot_id, docs)
    }

    fn delete(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        ids: &[ChunkId],
    ) -> Result<(), IndexError> {
        self.inner.delete_ids(repo_id, snapshot_id, ids)
    }

    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
        candidates: Option<&HashSet<ChunkId>>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.inner
            .search_docs(repo_id, snapshot_id, query, limit, candidates, SearchSource::Vector)
    }
}

/// Whether a document is documentation rather than code.
pub fn is_domain_doc(doc: &IndexDocument) -> bool {
    let path = doc.file_path.to_lowercase();
    let name = path.rsplit('/').next().unwrap_or(&path);

    if ["readme", "changelog", "license", "contributing", "code_of_conduct"]
        .iter()
        .any(|p| name.contains(p))
    {
        return true;
    }
    if [".md", ".rst", ".adoc", ".txt"].iter().any(|e| path.ends_with(e)) {
        return true;
    }
    path.starts_with("docs/") || path.contains("/docs/")
}

/// `DomainMetaIndexPort` over its own embedding collection; callers feed it
/// the documentation subset of a batch.
pub struct DomainDocIndex {
    inner: EmbeddingIndex,
}

impl DomainDocIndex {
    pub fn new(store: VectorStore, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            inner: EmbeddingIndex::new(store, embedder),
        }
    }
}

impl DomainMetaIndexPort for DomainDocIndex {
    fn index(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        self.inner.replace_collection(repo_id, snapshot_id, docs)
    }

    fn upsert(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        self.inner.upsert_docs(repo_id, snapshot_id, docs)
    }

    fn delete(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        ids: &[ChunkId],
    ) -> Result<(), IndexError> {
        self.inner.delete_ids(repo_id, snapshot_id, ids)
    }

    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        self.inner
            .search_docs(repo_id, snapshot_id, query, limit, None, SearchSource::Domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ChunkKind, Language};

    const DIM: usize = 64;

    fn doc(id: u128, path: &str, content: &str) -> IndexDocument {
        IndexDocument {
            id: ChunkId(id),
            repo_id: "r1".into(),
            snapshot_id: "s1".into(),
            file_path: path.into(),
            language: Language::Python,
            symbol_id: None,
            symbol_name: None,
            content: content.into(),
            identifiers: Vec::new(),
            tags: [("kind".to_string(), ChunkKind::Function.name().to_string())]
                .into_iter()
                .collect(),
            start_line: None,
            end_line: None,
        }
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(DIM);
        let v1 = e.embed("parse the config file").unwrap();
        let v2 = e.embed("parse the config file").unwrap();
        assert_eq!(v1, v2);
        let norm: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_text_ranks_higher() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(DIM));
        let index = UsearchVectorIndex::new(VectorStore::new(DIM).unwrap(), embedder);
        index
            .index(
                "r1",
                "s1",
                &[
                    doc(1, "a.py", "parse json configuration file"),
                    doc(2, "b.py", "render html template page"),
                ],
            )
            .unwrap();

        let hits = index.search("r1", "s1", "parse configuration", 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, ChunkId(1));
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| h.score > 0.0 && h.score <= 1.0));
        assert!(hits.iter().all(|h| h.source == SearchSource::Vector));
    }

    #[test]
    fn index_replaces_collection() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(DIM));
        let index = UsearchVectorIndex::new(VectorStore::new(DIM).unwrap(), embedder);
        index.index("r1", "s1", &[doc(1, "a.py", "alpha")]).unwrap();
        index.index("r1", "s1", &[doc(2, "b.py", "alpha")]).unwrap();

        let hits = index.search("r1", "s1", "alpha", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, ChunkId(2));
    }

    #[test]
    fn delete_removes_ids() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(DIM));
        let index = UsearchVectorIndex::new(VectorStore::new(DIM).unwrap(), embedder);
        index
            .index("r1", "s1", &[doc(1, "a.py", "alpha"), doc(2, "b.py", "alpha")])
            .unwrap();
        index.delete("r1", "s1", &[ChunkId(1)]).unwrap();

        let hits = index.search("r1", "s1", "alpha", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, ChunkId(2));
    }

    #[test]
    fn domain_doc_detection() {
        assert!(is_domain_doc(&doc(1, "README.md", "intro")));
        assert!(is_domain_doc(&doc(1, "docs/guide.html", "guide")));
        assert!(is_domain_doc(&doc(1, "notes.txt", "notes")));
        assert!(is_domain_doc(&doc(1, "project/docs/api.html", "api")));
        assert!(!is_domain_doc(&doc(1, "src/main.py", "code")));
    }

    #[test]
    fn domain_index_tags_hits_with_domain_source() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(DIM));
        let index = DomainDocIndex::new(VectorStore::new(DIM).unwrap(), embedder);
        index
            .index("r1", "s1", &[doc(1, "README.md", "project overview and setup")])
            .unwrap();
        let hits = index.search("r1", "s1", "setup overview", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, SearchSource::Domain);
    }
}
