use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkId;
use crate::language::Language;

/// Unified document record fed to the vector, fuzzy, and domain indexes.
///
/// The base lexical index works on raw source files and does not consume
/// `IndexDocument`. `(repo_id, snapshot_id, id)` is unique; `content` is
/// never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Document ID; equals the source chunk ID for stable references.
    pub id: ChunkId,
    pub repo_id: String,
    /// Snapshot/commit identifier -- the index-consistency granularity.
    pub snapshot_id: String,
    pub file_path: String,
    pub language: Language,
    pub symbol_id: Option<String>,
    pub symbol_name: Option<String>,
    /// Full search text: `[SUMMARY]` + `[SIGNATURE]` + `[CODE]` + `[META]`.
    pub content: String,
    /// Top identifiers: symbol name, FQN parts, declaration heads (max 10).
    pub identifiers: Vec<String>,
    /// Filtering/ranking tags. Always carries `kind`; may carry
    /// `repomap_score`, `module`, `visibility`, `parent_chunk_id`,
    /// `is_entrypoint`, `is_test`.
    pub tags: BTreeMap<String, String>,
    /// 0-indexed line span, when known.
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
}

/// Index backend that produced a `SearchHit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchSource {
    Lexical,
    Vector,
    Symbol,
    Fuzzy,
    Domain,
    Runtime,
    Fused,
}

impl SearchSource {
    pub fn name(self) -> &'static str {
        match self {
            Self::Lexical => "lexical",
            Self::Vector => "vector",
            Self::Symbol => "symbol",
            Self::Fuzzy => "fuzzy",
            Self::Domain => "domain",
            Self::Runtime => "runtime",
            Self::Fused => "fused",
        }
    }
}

/// Typed metadata carried on a `SearchHit`.
///
/// Core fields are explicit; anything backend-specific beyond them goes into
/// `extra` as string pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitMetadata {
    /// Matched line number (lexical hits).
    pub line: Option<u32>,
    /// Matched text preview (lexical hits).
    pub preview: Option<String>,
    /// Chunk kind, when known.
    pub kind: Option<String>,
    /// Whether the hit maps to a real chunk (`false` for file-level virtual
    /// hits from the delta index).
    pub mapped: Option<bool>,
    /// Raw vector distance (vector hits).
    pub distance: Option<f32>,
    /// Matched edge type (symbol hits), e.g. "calls", "imports".
    pub edge_type: Option<String>,
    /// Routed query intent (symbol hits), e.g. "callers".
    pub intent: Option<String>,
    /// Sources that contributed to a fused hit (empty unless fused from
    /// multiple sources).
    pub sources: Vec<SearchSource>,
    /// Per-source scores preserved through fusion.
    pub original_scores: Vec<(SearchSource, f32)>,
    pub extra: BTreeMap<String, String>,
}

/// A scored match annotated with its source backend.
///
/// Scores are comparable within one source; the fusion layer normalizes
/// across sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub file_path: Option<String>,
    pub symbol_id: Option<String>,
    pub score: f32,
    pub source: SearchSource,
    pub metadata: HitMetadata,
}

impl SearchHit {
    /// A hit with empty metadata, for backends that have nothing extra to say.
    pub fn new(chunk_id: ChunkId, file_path: Option<String>, score: f32, source: SearchSource) -> Self {
        Self {
            chunk_id,
            file_path,
            symbol_id: None,
            score,
            source,
            metadata: HitMetadata::default(),
        }
    }
}
