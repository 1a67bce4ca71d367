use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use strata_core::{Chunk, ChunkId, IndexDocument, IrDocument};

/// Importance scores for chunks, produced by the repo-map layer.
#[derive(Debug, Clone, Default)]
pub struct RepoMapSnapshot {
    scores: HashMap<ChunkId, f64>,
}

impl RepoMapSnapshot {
    pub fn new(scores: HashMap<ChunkId, f64>) -> Self {
        Self { scores }
    }

    pub fn score_for(&self, chunk_id: ChunkId) -> Option<f64> {
        self.scores.get(&chunk_id).copied()
    }
}

/// At most this many identifiers per document.
const MAX_IDENTIFIERS: usize = 10;

/// Normalizes parser chunks into the unified `IndexDocument` record fed to
/// the vector, fuzzy, and domain indexes.
///
/// Transformation never fails per document: a chunk with nothing usable
/// still yields a minimally populated document (and a warning), so one bad
/// chunk cannot sink a batch.
pub struct IndexDocumentTransformer {
    repomap: Option<RepoMapSnapshot>,
    ir_document: Option<IrDocument>,
}

impl IndexDocumentTransformer {
    pub fn new(repomap: Option<RepoMapSnapshot>, ir_document: Option<IrDocument>) -> Self {
        Self {
            repomap,
            ir_document,
        }
    }

    /// Transform a batch in parallel, preserving input order.
    pub fn transform_batch(
        &self,
        chunks: &[Chunk],
        source_codes: Option<&HashMap<ChunkId, String>>,
        snapshot_id: &str,
    ) -> Vec<IndexDocument> {
        chunks
            .par_iter()
            .map(|chunk| self.transform(chunk, source_codes, snapshot_id))
            .collect()
    }

    /// Transform a single chunk.
    pub fn transform(
        &self,
        chunk: &Chunk,
        source_codes: Option<&HashMap<ChunkId, String>>,
        snapshot_id: &str,
    ) -> IndexDocument {
        let signature = chunk.signature.clone().or_else(|| {
            // Fall back to the IR symbol's signature when the chunk has none.
            let ir = self.ir_document.as_ref()?;
            let symbol_id = chunk.symbol_id.as_deref()?;
            ir.symbol(symbol_id)?.signature.clone()
        });

        let code = source_codes
            .and_then(|codes| codes.get(&chunk.id))
            .map(String::as_str)
            .unwrap_or(&chunk.content);

        let mut content = compose_content(
            chunk.doc_comment.as_deref(),
            signature.as_deref(),
            code,
            chunk,
        );
        if content.is_empty() {
            tracing::warn!(
                chunk_id = %chunk.id,
                file_path = %chunk.file_path,
                "chunk produced empty content, emitting minimal document"
            );
            content = chunk
                .symbol_name
                .clone()
                .unwrap_or_else(|| chunk.file_path.clone());
        }

        IndexDocument {
            id: chunk.id,
            repo_id: chunk.repo_id.clone(),
            snapshot_id: snapshot_id.to_string(),
            file_path: chunk.file_path.clone(),
            language: chunk.language,
            symbol_id: chunk.symbol_id.clone(),
            symbol_name: chunk.symbol_name.clone(),
            identifiers: extract_identifiers(chunk, &content),
            tags: build_tags(chunk, self.repomap.as_ref()),
            content,
            start_line: Some(chunk.line_range.start),
            end_line: Some(chunk.line_range.end),
        }
    }
}

/// `[SUMMARY] <doc>\n[SIGNATURE] <sig>\n[CODE] <code>\n[META] kind=…,module=…`
/// with empty sections omitted.
fn compose_content(
    doc_comment: Option<&str>,
    signature: Option<&str>,
    code: &str,
    chunk: &Chunk,
) -> String {
    let mut sections = Vec::with_capacity(4);
    if let Some(doc) = doc_comment.filter(|d| !d.trim().is_empty()) {
        sections.push(format!("[SUMMARY] {}", doc.trim()));
    }
    if let Some(sig) = signature.filter(|s| !s.trim().is_empty()) {
        sections.push(format!("[SIGNATURE] {}", sig.trim()));
    }
    if !code.trim().is_empty() {
        sections.push(format!("[CODE] {}", code.trim()));
    }
    let mut meta = format!("kind={}", chunk.kind.name());
    if let Some(module) = chunk.module.as_deref().filter(|m| !m.is_empty()) {
        meta.push_str(&format!(",module={module}"));
    }
    sections.push(format!("[META] {meta}"));

    if sections.len() == 1 && code.trim().is_empty() {
        // Meta alone does not count as real content.
        String::new()
    } else {
        sections.join("\n")
    }
}

/// Union of symbol name, FQN parts, and declaration heads scanned from the
/// content; top-10, deduped case-insensitively, insertion order kept.
fn extract_identifiers(chunk: &Chunk, content: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut push = |candidate: &str| {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            return;
        }
        if seen.insert(trimmed.to_lowercase()) {
            out.push(trimmed.to_string());
        }
    };

    if let Some(name) = chunk.symbol_name.as_deref() {
        push(name);
    }
    if let Some(fqn) = chunk.symbol_id.as_deref() {
        for part in fqn.split(['.', '/']) {
            push(part);
        }
    }
    for line in content.lines() {
        for head in declaration_heads(line) {
            push(head);
        }
    }

    out.truncate(MAX_IDENTIFIERS);
    out
}

/// Names declared on one line: `def name(`, `class name`, `fn name(`, and
/// `name = …` assignment heads.
fn declaration_heads(line: &str) -> Vec<&str> {
    let trimmed = line.trim();
    let mut heads = Vec::new();

    for prefix in ["def ", "fn ", "class "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let end = rest
                .find(|c: char| !c.is_alphanumeric() && c != '_')
                .unwrap_or(rest.len());
            if end > 0 {
                heads.push(&rest[..end]);
            }
        }
    }

    // `name = value` (single assignment, not `==`)
    if heads.is_empty() {
        if let Some(eq) = trimmed.find('=') {
            let is_eqeq = trimmed[eq..].starts_with("==");
            let lhs = trimmed[..eq].trim();
            if !is_eqeq
                && !lhs.is_empty()
                && lhs.chars().all(|c| c.is_alphanumeric() || c == '_')
                && !lhs.chars().next().is_some_and(|c| c.is_ascii_digit())
            {
                heads.push(lhs);
            }
        }
    }
    heads
}

fn build_tags(chunk: &Chunk, repomap: Option<&RepoMapSnapshot>) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("kind".to_string(), chunk.kind.name().to_string());
    if let Some(score) = repomap.and_then(|m| m.score_for(chunk.id)) {
        tags.insert("repomap_score".to_string(), score.to_string());
    }
    if let Some(module) = chunk.module.as_deref() {
        tags.insert("module".to_string(), module.to_string());
    }
    if let Some(visibility) = chunk.visibility.as_deref() {
        tags.insert("visibility".to_string(), visibility.to_string());
    }
    if let Some(parent) = chunk.parent_chunk_id {
        tags.insert("parent_chunk_id".to_string(), parent.to_string());
    }
    tags.insert("is_entrypoint".to_string(), chunk.is_entrypoint.to_string());
    tags.insert("is_test".to_string(), chunk.is_test.to_string());
    tags
}
