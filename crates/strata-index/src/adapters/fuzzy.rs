use std::sync::Arc;

use strata_core::{ChunkId, HitMetadata, IndexDocument, SearchHit, SearchSource};
use strata_storage::fuzzy::TrigramStore;

use crate::error::IndexError;
use crate::ports::FuzzyIndexPort;

/// Fuzzy identifier index over the trigram store.
pub struct TrigramFuzzyIndex {
    store: Arc<TrigramStore>,
}

impl TrigramFuzzyIndex {
    pub fn new(store: Arc<TrigramStore>) -> Self {
        Self { store }
    }

    fn upsert_docs(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        for doc in docs {
            self.store.upsert_chunk(
                repo_id,
                snapshot_id,
                doc.id,
                &doc.file_path,
                doc.symbol_id.as_deref(),
                &doc.identifiers,
            )?;
        }
        Ok(())
    }
}

impl FuzzyIndexPort for TrigramFuzzyIndex {
    fn index(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        self.store.delete_collection(repo_id, snapshot_id)?;
        self.upsert_docs(repo_id, snapshot_id, docs)
    }

    fn upsert(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        docs: &[IndexDocument],
    ) -> Result<(), IndexError> {
        self.upsert_docs(repo_id, snapshot_id, docs)
    }

    fn delete(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        ids: &[ChunkId],
    ) -> Result<(), IndexError> {
        self.store.delete_chunks(repo_id, snapshot_id, ids)?;
        Ok(())
    }

    fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let hits = self.store.search(repo_id, snapshot_id, query, limit)?;
        Ok(hits
            .into_iter()
            .map(|h| SearchHit {
                chunk_id: h.chunk_id,
                file_path: Some(h.file_path),
                symbol_id: h.symbol_id,
                score: h.similarity,
                source: SearchSource::Fuzzy,
                metadata: HitMetadata {
                    extra: [
                        ("match_type".to_string(), "trigram".to_string()),
                        ("identifier".to_string(), h.identifier),
                    ]
                    .into_iter()
                    .collect(),
                    ..Default::default()
                },
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ChunkKind, Language};

    fn doc(id: u128, identifiers: &[&str]) -> IndexDocument {
        IndexDocument {
            id: ChunkId(id),
            repo_id: "r1".into(),
            snapshot_id: "s1".into(),
            file_path: "src/a.py".into(),
            language: Language::Python,
            symbol_id: Some("a.calc".into()),
            symbol_name: Some("calc".into()),
            content: "[CODE] x".into(),
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            tags: [("kind".to_string(), ChunkKind::Function.name().to_string())]
                .into_iter()
                .collect(),
            start_line: None,
            end_line: None,
        }
    }

    #[test]
    fn typo_search_scores_and_sources() {
        let index = TrigramFuzzyIndex::new(Arc::new(TrigramStore::open_in_memory().unwrap()));
        index
            .index("r1", "s1", &[doc(1, &["calculate_total", "items"])])
            .unwrap();

        let hits = index.search("r1", "s1", "calcualte_total", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, SearchSource::Fuzzy);
        assert!(hits[0].score > 0.3);
        assert_eq!(
            hits[0].metadata.extra.get("identifier").unwrap(),
            "calculate_total"
        );
    }

    #[test]
    fn index_replaces_then_delete_removes() {
        let index = TrigramFuzzyIndex::new(Arc::new(TrigramStore::open_in_memory().unwrap()));
        index.index("r1", "s1", &[doc(1, &["first_name"])]).unwrap();
        index.index("r1", "s1", &[doc(2, &["second_name"])]).unwrap();
        assert!(index.search("r1", "s1", "first_name", 10).unwrap().is_empty());

        index.delete("r1", "s1", &[ChunkId(2)]).unwrap();
        assert!(index.search("r1", "s1", "second_name", 10).unwrap().is_empty());
    }
}
