use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

use crate::language::Language;

/// Deterministic chunk identifier, computed as XXH3-128 of
/// `repo_id|relative_path|chunk|byte_start|byte_end`.
///
/// The literal `chunk` in the hash input domain-separates chunk IDs from the
/// `virtual` IDs synthesized for file-level delta hits, so the two can never
/// collide even on identical inputs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u128);

impl ChunkId {
    /// Generate a deterministic chunk ID from its identifying fields.
    pub fn generate(
        repo_id: &str,
        relative_path: &str,
        byte_start: usize,
        byte_end: usize,
    ) -> Self {
        let input = format!(
            "{}|{}|chunk|{}|{}",
            repo_id, relative_path, byte_start, byte_end
        );
        Self(xxh3_128(input.as_bytes()))
    }

    /// Synthesize a stable ID for a file-level hit that has no chunk mapping.
    ///
    /// Used by the delta lexical index, which tracks whole files: its hits
    /// still need a `ChunkId` so rank fusion can group them, but there is no
    /// parser chunk behind them (`HitMetadata.mapped` is `false`).
    pub fn virtual_for_file(repo_id: &str, relative_path: &str) -> Self {
        let input = format!("{}|{}|virtual", repo_id, relative_path);
        Self(xxh3_128(input.as_bytes()))
    }

    /// Synthesize a stable ID for a symbol-level hit that has no chunk
    /// mapping (symbol index results).
    pub fn for_symbol(repo_id: &str, symbol_id: &str) -> Self {
        let input = format!("{}|{}|symbol", repo_id, symbol_id);
        Self(xxh3_128(input.as_bytes()))
    }

    pub fn as_bytes(&self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({:032x})", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Semantic kind of a parser-emitted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkKind {
    File = 0,
    Class = 1,
    Function = 2,
    Method = 3,
    Doc = 4,
    Other = 5,
}

impl ChunkKind {
    pub fn from_ordinal(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::File),
            1 => Some(Self::Class),
            2 => Some(Self::Function),
            3 => Some(Self::Method),
            4 => Some(Self::Doc),
            5 => Some(Self::Other),
            _ => None,
        }
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Class => "class",
            Self::Function => "function",
            Self::Method => "method",
            Self::Doc => "doc",
            Self::Other => "other",
        }
    }
}

/// A parser-emitted slice of source with semantic kind and line span.
///
/// Chunks are the input unit of the indexing pipeline: the external parser
/// produces them, the transformer turns them into `IndexDocument`s, and the
/// per-kind indexes consume those. `id` is unique per (repo, snapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub repo_id: String,
    /// Relative to project root, forward-slash normalized.
    pub file_path: String,
    pub kind: ChunkKind,
    pub language: Language,
    /// 0-indexed, end-exclusive.
    pub line_range: Range<u32>,
    /// Symbol ID from the IR layer, when the chunk maps to one symbol.
    pub symbol_id: Option<String>,
    pub symbol_name: Option<String>,
    /// Source text of the chunk.
    pub content: String,
    pub doc_comment: Option<String>,
    pub signature: Option<String>,
    /// Dot-separated module path (e.g., "src.utils").
    pub module: Option<String>,
    pub visibility: Option<String>,
    pub parent_chunk_id: Option<ChunkId>,
    pub is_entrypoint: bool,
    pub is_test: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_deterministic() {
        let id1 = ChunkId::generate("repo1", "src/main.py", 100, 200);
        let id2 = ChunkId::generate("repo1", "src/main.py", 100, 200);
        assert_eq!(id1, id2);
    }

    #[test]
    fn chunk_id_changes_on_path_change() {
        let id1 = ChunkId::generate("repo1", "src/a.py", 0, 50);
        let id2 = ChunkId::generate("repo1", "src/b.py", 0, 50);
        assert_ne!(id1, id2);
    }

    #[test]
    fn chunk_id_changes_on_span_change() {
        let id1 = ChunkId::generate("repo1", "src/a.py", 0, 50);
        let id2 = ChunkId::generate("repo1", "src/a.py", 0, 51);
        assert_ne!(id1, id2);
    }

    #[test]
    fn virtual_id_differs_from_chunk_id() {
        // Same repo and path -- but different ID domain
        let chunk_id = ChunkId::generate("repo1", "src/main.py", 0, 100);
        let virtual_id = ChunkId::virtual_for_file("repo1", "src/main.py");
        assert_ne!(chunk_id, virtual_id);
    }

    #[test]
    fn virtual_id_deterministic() {
        let id1 = ChunkId::virtual_for_file("repo1", "src/a.py");
        let id2 = ChunkId::virtual_for_file("repo1", "src/a.py");
        assert_eq!(id1, id2);
        assert_ne!(id1, ChunkId::virtual_for_file("repo1", "src/b.py"));
    }

    #[test]
    fn chunk_id_bytes_round_trip() {
        let id = ChunkId::generate("repo1", "src/main.rs", 10, 20);
        let bytes = id.as_bytes();
        let id2 = ChunkId::from_bytes(bytes);
        assert_eq!(id, id2);
    }

    #[test]
    fn chunk_id_display_hex() {
        let id = ChunkId(0xDEAD_BEEF_CAFE_BABE_1234_5678_9ABC_DEF0);
        let hex = format!("{id}");
        assert_eq!(hex, "deadbeefcafebabe123456789abcdef0");
    }

    #[test]
    fn chunk_kind_ordinal_round_trip() {
        for n in 0..=5u8 {
            let kind = ChunkKind::from_ordinal(n).unwrap();
            assert_eq!(kind.ordinal(), n);
        }
        assert!(ChunkKind::from_ordinal(6).is_none());
    }
}
