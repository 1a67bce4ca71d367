use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use strata_core::{IrDocument, IrSymbol};

/// Overlay configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Max uncommitted files to track; excess files are dropped.
    pub max_overlay_files: usize,
    /// Reserved; nothing reads this yet.
    pub invalidation_timeout_ms: u64,
    /// Overlay always wins conflicts.
    pub overlay_priority: bool,
    pub track_deletions: bool,
    /// Merged-snapshot cache TTL.
    pub cache_ttl: Duration,
    pub enable_caching: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_overlay_files: 50,
            invalidation_timeout_ms: 5000,
            overlay_priority: true,
            track_deletions: true,
            cache_ttl: Duration::from_secs(60),
            enable_caching: true,
        }
    }
}

/// One edited, not-yet-committed file.
#[derive(Debug, Clone)]
pub struct UncommittedFile {
    pub file_path: String,
    pub content: String,
    pub timestamp: SystemTime,
    /// Lowercase hex SHA-256 of `content`.
    pub content_hash: String,
    /// Newly created (not present in the base).
    pub is_new: bool,
    /// Present in base but deleted in the overlay.
    pub is_deleted: bool,
}

/// Uncommitted edits layered on top of a base snapshot.
///
/// Owns its uncommitted files and overlay IR; the merged view derived from
/// it is cached here and invalidated on any mutation.
#[derive(Debug)]
pub struct OverlaySnapshot {
    /// Deterministic: `overlay_` + first 16 hex digits of
    /// SHA-256(base_id ∥ Σ sorted(path ∥ sha256(content))).
    pub snapshot_id: String,
    pub base_snapshot_id: String,
    pub repo_id: String,
    pub uncommitted_files: BTreeMap<String, UncommittedFile>,
    /// IR parsed from uncommitted files, keyed by path.
    pub overlay_ir_docs: BTreeMap<String, IrDocument>,
    /// Symbols whose identity, signature, or range differs from the base.
    pub affected_symbols: BTreeSet<String>,
    pub invalidated_files: BTreeSet<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    merged_cache: Option<(MergedSnapshot, Instant)>,
}

impl OverlaySnapshot {
    pub fn new(
        snapshot_id: impl Into<String>,
        base_snapshot_id: impl Into<String>,
        repo_id: impl Into<String>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            snapshot_id: snapshot_id.into(),
            base_snapshot_id: base_snapshot_id.into(),
            repo_id: repo_id.into(),
            uncommitted_files: BTreeMap::new(),
            overlay_ir_docs: BTreeMap::new(),
            affected_symbols: BTreeSet::new(),
            invalidated_files: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            merged_cache: None,
        }
    }

    pub fn add_uncommitted_file(&mut self, file: UncommittedFile) {
        self.uncommitted_files.insert(file.file_path.clone(), file);
        self.updated_at = SystemTime::now();
        self.invalidate_cache();
    }

    /// Remove an uncommitted file (e.g., reverted in the editor).
    pub fn remove_uncommitted_file(&mut self, file_path: &str) {
        if self.uncommitted_files.remove(file_path).is_some() {
            self.overlay_ir_docs.remove(file_path);
            self.updated_at = SystemTime::now();
            self.invalidate_cache();
        }
    }

    pub fn mark_affected_symbol(&mut self, symbol_id: impl Into<String>) {
        self.affected_symbols.insert(symbol_id.into());
    }

    pub fn is_cache_valid(&self, ttl: Duration) -> bool {
        matches!(self.merged_cache, Some((_, at)) if at.elapsed() < ttl)
    }

    pub fn cached_snapshot(&self, ttl: Duration) -> Option<&MergedSnapshot> {
        match &self.merged_cache {
            Some((merged, at)) if at.elapsed() < ttl => Some(merged),
            _ => None,
        }
    }

    pub fn cache_merged_snapshot(&mut self, merged: MergedSnapshot) {
        self.merged_cache = Some((merged, Instant::now()));
    }

    fn invalidate_cache(&mut self) {
        self.merged_cache = None;
    }
}

/// Kind of divergence between a base symbol and its overlay counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    SignatureChange,
    Deletion,
    Move,
}

impl ConflictKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::SignatureChange => "signature_change",
            Self::Deletion => "deletion",
            Self::Move => "move",
        }
    }
}

/// How a conflict was resolved. Overlay always wins under the core policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictResolution {
    #[default]
    OverlayWins,
}

/// (file, line, column) of a symbol occurrence.
pub type SymbolLocation = (String, u32, u32);

/// A divergence between the base and overlay versions of one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConflict {
    pub symbol_id: String,
    pub base_signature: Option<String>,
    pub base_location: Option<SymbolLocation>,
    pub overlay_signature: Option<String>,
    pub overlay_location: Option<SymbolLocation>,
    pub kind: ConflictKind,
    pub resolution: ConflictResolution,
}

impl SymbolConflict {
    /// Whether this conflict likely breaks dependents.
    ///
    /// Deletions always do. A signature change counts as breaking when the
    /// overlay signature is strictly shorter than the base one -- a proxy
    /// for removed parameters. A structural parameter diff would classify
    /// same-length rewrites better; this string-length check is the agreed
    /// placeholder.
    pub fn is_breaking_change(&self) -> bool {
        match self.kind {
            ConflictKind::Deletion => true,
            ConflictKind::SignatureChange => match (&self.base_signature, &self.overlay_signature) {
                (Some(base), Some(overlay)) => overlay.len() < base.len(),
                _ => false,
            },
            ConflictKind::Move => false,
        }
    }
}

/// A symbol in the merged view, stamped with the file it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedSymbol {
    pub file_path: String,
    pub symbol: IrSymbol,
}

/// The query-visible unification of base + overlay. Overlay symbols strictly
/// override base symbols with the same ID.
#[derive(Debug, Clone)]
pub struct MergedSnapshot {
    /// `merged_` + overlay snapshot ID.
    pub snapshot_id: String,
    pub base_snapshot_id: String,
    pub overlay_snapshot_id: String,
    pub repo_id: String,
    pub ir_documents: BTreeMap<String, IrDocument>,
    pub symbol_index: BTreeMap<String, MergedSymbol>,
    /// (caller_id, callee_id)
    pub call_graph_edges: BTreeSet<(String, String)>,
    /// (importer_path, module)
    pub import_graph_edges: BTreeSet<(String, String)>,
    pub conflicts: Vec<SymbolConflict>,
    pub merged_at: SystemTime,
}

impl MergedSnapshot {
    /// Get a symbol (overlay priority is already baked into the index).
    pub fn get_symbol(&self, symbol_id: &str) -> Option<&MergedSymbol> {
        self.symbol_index.get(symbol_id)
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn breaking_changes(&self) -> Vec<&SymbolConflict> {
        self.conflicts
            .iter()
            .filter(|c| c.is_breaking_change())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(kind: ConflictKind, base: Option<&str>, overlay: Option<&str>) -> SymbolConflict {
        SymbolConflict {
            symbol_id: "m.f".into(),
            base_signature: base.map(str::to_string),
            base_location: None,
            overlay_signature: overlay.map(str::to_string),
            overlay_location: None,
            kind,
            resolution: ConflictResolution::OverlayWins,
        }
    }

    #[test]
    fn deletion_is_always_breaking() {
        let c = conflict(ConflictKind::Deletion, Some("(x) -> int"), None);
        assert!(c.is_breaking_change());
    }

    #[test]
    fn shorter_signature_is_breaking() {
        let c = conflict(
            ConflictKind::SignatureChange,
            Some("(user: User, role: str) -> None"),
            Some("(user: User) -> None"),
        );
        assert!(c.is_breaking_change());
    }

    #[test]
    fn longer_signature_is_not_breaking() {
        let c = conflict(
            ConflictKind::SignatureChange,
            Some("(x: int, y: int) -> int"),
            Some("(x: int, y: int, z: int) -> int"),
        );
        assert!(!c.is_breaking_change());
    }

    #[test]
    fn move_is_not_breaking() {
        let c = conflict(ConflictKind::Move, Some("(x)"), Some("(x)"));
        assert!(!c.is_breaking_change());
    }

    #[test]
    fn mutation_invalidates_cache() {
        let mut overlay = OverlaySnapshot::new("overlay_x", "base", "r1");
        let merged = MergedSnapshot {
            snapshot_id: "merged_overlay_x".into(),
            base_snapshot_id: "base".into(),
            overlay_snapshot_id: "overlay_x".into(),
            repo_id: "r1".into(),
            ir_documents: BTreeMap::new(),
            symbol_index: BTreeMap::new(),
            call_graph_edges: BTreeSet::new(),
            import_graph_edges: BTreeSet::new(),
            conflicts: Vec::new(),
            merged_at: SystemTime::now(),
        };
        overlay.cache_merged_snapshot(merged);
        assert!(overlay.is_cache_valid(Duration::from_secs(60)));

        overlay.add_uncommitted_file(UncommittedFile {
            file_path: "src/a.py".into(),
            content: "x = 1".into(),
            timestamp: SystemTime::now(),
            content_hash: "deadbeef".into(),
            is_new: true,
            is_deleted: false,
        });
        assert!(!overlay.is_cache_valid(Duration::from_secs(60)));
    }

    #[test]
    fn cache_respects_ttl() {
        let mut overlay = OverlaySnapshot::new("overlay_x", "base", "r1");
        let merged = MergedSnapshot {
            snapshot_id: "merged_overlay_x".into(),
            base_snapshot_id: "base".into(),
            overlay_snapshot_id: "overlay_x".into(),
            repo_id: "r1".into(),
            ir_documents: BTreeMap::new(),
            symbol_index: BTreeMap::new(),
            call_graph_edges: BTreeSet::new(),
            import_graph_edges: BTreeSet::new(),
            conflicts: Vec::new(),
            merged_at: SystemTime::now(),
        };
        overlay.cache_merged_snapshot(merged);
        assert!(overlay.cached_snapshot(Duration::from_secs(60)).is_some());
        assert!(overlay.cached_snapshot(Duration::ZERO).is_none());
    }
}
