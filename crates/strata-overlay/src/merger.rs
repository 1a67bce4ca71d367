use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use strata_core::{IrDocument, IrSymbol};

use crate::error::OverlayError;
use crate::models::{
    ConflictKind, ConflictResolution, MergedSnapshot, MergedSymbol, OverlaySnapshot,
    SymbolConflict, SymbolLocation,
};
use crate::resolver::ConflictResolver;

/// Read access to the committed base graph, implemented by the symbol
/// graph store.
pub trait BaseGraphSource: Send + Sync {
    /// (caller_id, callee_id) edges of the base snapshot.
    fn call_edges(
        &self,
        repo_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<(String, String)>, OverlayError>;

    /// (importer_path, module) edges of the base snapshot.
    fn import_edges(
        &self,
        repo_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<(String, String)>, OverlayError>;

    /// File a base symbol lives in, when known.
    fn symbol_file(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        symbol_id: &str,
    ) -> Result<Option<String>, OverlayError>;
}

/// Merges base + overlay into a unified, query-visible snapshot.
///
/// Overlay symbols override base symbols with the same ID; base edges
/// touching affected symbols or overlay files are dropped and replaced by
/// edges from the overlay IR. Conflicts are detected, resolved (overlay
/// wins), and surfaced on the result.
pub struct GraphMerger {
    graph_source: Option<Arc<dyn BaseGraphSource>>,
    resolver: ConflictResolver,
    cache_ttl: std::time::Duration,
}

impl GraphMerger {
    pub fn new(
        graph_source: Option<Arc<dyn BaseGraphSource>>,
        cache_ttl: std::time::Duration,
    ) -> Self {
        Self {
            graph_source,
            resolver: ConflictResolver,
            cache_ttl,
        }
    }

    #[tracing::instrument(skip_all, fields(base_snapshot_id, overlay_id = %overlay.snapshot_id))]
    pub fn merge_graphs(
        &self,
        base_snapshot_id: &str,
        overlay: &mut OverlaySnapshot,
        base_ir_docs: &BTreeMap<String, IrDocument>,
    ) -> MergedSnapshot {
        if let Some(cached) = overlay.cached_snapshot(self.cache_ttl) {
            tracing::info!("using cached merged snapshot");
            return cached.clone();
        }

        // Step 1: IR documents, overlay wins per file.
        let mut ir_documents = base_ir_docs.clone();
        for (path, doc) in &overlay.overlay_ir_docs {
            ir_documents.insert(path.clone(), doc.clone());
        }

        // Step 2: unified symbol index over the merged docs.
        let symbol_index = build_symbol_index(&ir_documents);

        // Step 3: conflicts between base and overlay symbol sets.
        let conflicts: Vec<SymbolConflict> =
            detect_conflicts(base_ir_docs, &overlay.overlay_ir_docs)
                .into_iter()
                .map(|c| self.resolver.resolve(c))
                .collect();

        // Steps 4-5: edge merges.
        let call_graph_edges = self.merge_call_graph(base_snapshot_id, overlay);
        let import_graph_edges = self.merge_import_graph(base_snapshot_id, overlay);

        let merged = MergedSnapshot {
            snapshot_id: format!("merged_{}", overlay.snapshot_id),
            base_snapshot_id: base_snapshot_id.to_string(),
            overlay_snapshot_id: overlay.snapshot_id.clone(),
            repo_id: overlay.repo_id.clone(),
            ir_documents,
            symbol_index,
            call_graph_edges,
            import_graph_edges,
            conflicts,
            merged_at: SystemTime::now(),
        };

        tracing::info!(
            num_ir_docs = merged.ir_documents.len(),
            num_symbols = merged.symbol_index.len(),
            num_conflicts = merged.conflicts.len(),
            num_call_edges = merged.call_graph_edges.len(),
            num_import_edges = merged.import_graph_edges.len(),
            "graphs merged"
        );

        overlay.cache_merged_snapshot(merged.clone());
        merged
    }

    /// Base call edges minus those touching affected symbols, plus all call
    /// edges from the overlay IR.
    fn merge_call_graph(
        &self,
        base_snapshot_id: &str,
        overlay: &OverlaySnapshot,
    ) -> BTreeSet<(String, String)> {
        let mut edges = BTreeSet::new();

        if let Some(source) = &self.graph_source {
            match source.call_edges(&overlay.repo_id, base_snapshot_id) {
                Ok(base_edges) => {
                    for (caller, callee) in base_edges {
                        if !overlay.affected_symbols.contains(&caller)
                            && !overlay.affected_symbols.contains(&callee)
                        {
                            edges.insert((caller, callee));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load base call graph");
                }
            }
        }

        for doc in overlay.overlay_ir_docs.values() {
            for symbol in &doc.symbols {
                for call in &symbol.calls {
                    edges.insert((symbol.id.clone(), call.target_id.clone()));
                }
            }
        }
        edges
    }

    /// Base import edges minus those whose importer is an overlay file, plus
    /// all overlay import edges.
    fn merge_import_graph(
        &self,
        base_snapshot_id: &str,
        overlay: &OverlaySnapshot,
    ) -> BTreeSet<(String, String)> {
        let mut edges = BTreeSet::new();

        if let Some(source) = &self.graph_source {
            match source.import_edges(&overlay.repo_id, base_snapshot_id) {
                Ok(base_edges) => {
                    for (importer, imported) in base_edges {
                        if !overlay.uncommitted_files.contains_key(&importer) {
                            edges.insert((importer, imported));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load base import graph");
                }
            }
        }

        for (path, doc) in &overlay.overlay_ir_docs {
            for import in &doc.imports {
                edges.insert((path.clone(), import.module.clone()));
            }
        }
        edges
    }
}

/// Computes which base files are invalidated by overlay changes: files whose
/// symbols call an affected symbol, and files that import an affected
/// symbol's module. Overlay files themselves are excluded (they are already
/// re-parsed).
pub struct InvalidationComputer {
    source: Arc<dyn BaseGraphSource>,
}

impl InvalidationComputer {
    pub fn new(source: Arc<dyn BaseGraphSource>) -> Self {
        Self { source }
    }

    /// Resolve the invalidated-file set and record it on the overlay.
    pub fn compute_invalidated_files(
        &self,
        overlay: &mut OverlaySnapshot,
        base_snapshot_id: &str,
    ) -> Result<BTreeSet<String>, OverlayError> {
        let mut invalidated = BTreeSet::new();

        for (caller, callee) in self.source.call_edges(&overlay.repo_id, base_snapshot_id)? {
            if !overlay.affected_symbols.contains(&callee) {
                continue;
            }
            let Some(file) =
                self.source
                    .symbol_file(&overlay.repo_id, base_snapshot_id, &caller)?
            else {
                continue;
            };
            if !overlay.uncommitted_files.contains_key(&file) {
                invalidated.insert(file);
            }
        }

        for (importer, module) in self.source.import_edges(&overlay.repo_id, base_snapshot_id)? {
            let prefix = format!("{module}.");
            let imports_affected = overlay
                .affected_symbols
                .iter()
                .any(|s| s.starts_with(&prefix) || *s == module);
            if imports_affected && !overlay.uncommitted_files.contains_key(&importer) {
                invalidated.insert(importer);
            }
        }

        tracing::info!(
            num_affected_symbols = overlay.affected_symbols.len(),
            num_invalidated_files = invalidated.len(),
            "invalidated files computed"
        );
        overlay.invalidated_files = invalidated.clone();
        Ok(invalidated)
    }
}

fn build_symbol_index(ir_documents: &BTreeMap<String, IrDocument>) -> BTreeMap<String, MergedSymbol> {
    let mut index = BTreeMap::new();
    for (file_path, doc) in ir_documents {
        for symbol in &doc.symbols {
            index.insert(
                symbol.id.clone(),
                MergedSymbol {
                    file_path: file_path.clone(),
                    symbol: symbol.clone(),
                },
            );
        }
    }
    index
}

fn location(file_path: &str, symbol: &IrSymbol) -> SymbolLocation {
    (
        file_path.to_string(),
        symbol.range.start_line,
        symbol.range.start_col,
    )
}

/// Conflicts over the union of base/overlay symbol IDs: a base-only symbol
/// is a deletion, differing signatures are a signature change, and
/// overlay-only symbols are additions (not conflicts).
fn detect_conflicts(
    base_docs: &BTreeMap<String, IrDocument>,
    overlay_docs: &BTreeMap<String, IrDocument>,
) -> Vec<SymbolConflict> {
    let mut base_symbols: BTreeMap<&str, (&str, &IrSymbol)> = BTreeMap::new();
    for (path, doc) in base_docs {
        for symbol in &doc.symbols {
            base_symbols.insert(&symbol.id, (path, symbol));
        }
    }
    let mut overlay_symbols: BTreeMap<&str, (&str, &IrSymbol)> = BTreeMap::new();
    for (path, doc) in overlay_docs {
        for symbol in &doc.symbols {
            overlay_symbols.insert(&symbol.id, (path, symbol));
        }
    }

    let all_ids: BTreeSet<&str> = base_symbols
        .keys()
        .chain(overlay_symbols.keys())
        .copied()
        .collect();

    let mut conflicts = Vec::new();
    for id in all_ids {
        match (base_symbols.get(id), overlay_symbols.get(id)) {
            (Some((base_path, base_sym)), None) => conflicts.push(SymbolConflict {
                symbol_id: id.to_string(),
                base_signature: base_sym.signature.clone(),
                base_location: Some(location(base_path, base_sym)),
                overlay_signature: None,
                overlay_location: None,
                kind: ConflictKind::Deletion,
                resolution: ConflictResolution::OverlayWins,
            }),
            (Some((base_path, base_sym)), Some((over_path, over_sym)))
                if base_sym.signature != over_sym.signature =>
            {
                conflicts.push(SymbolConflict {
                    symbol_id: id.to_string(),
                    base_signature: base_sym.signature.clone(),
                    base_location: Some(location(base_path, base_sym)),
                    overlay_signature: over_sym.signature.clone(),
                    overlay_location: Some(location(over_path, over_sym)),
                    kind: ConflictKind::SignatureChange,
                    resolution: ConflictResolution::OverlayWins,
                })
            }
            _ => {}
        }
    }
    conflicts
}
