use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use strata_core::IrDocument;

use crate::error::OverlayError;
use crate::models::{OverlayConfig, OverlaySnapshot, UncommittedFile};

/// External parser contract: turns one file's text into IR.
pub trait IrBuilder: Send + Sync {
    fn build_file_ir(&self, file_path: &str, content: &str) -> Result<IrDocument, OverlayError>;
}

/// Builds an `OverlaySnapshot` from uncommitted file contents.
///
/// Parses each file via the external IR builder and computes the set of
/// affected symbols against the base IR. Per-file parse failures are logged
/// and skipped; the rest of the overlay still builds.
pub struct OverlayBuilder {
    ir_builder: Arc<dyn IrBuilder>,
    config: OverlayConfig,
}

impl OverlayBuilder {
    pub fn new(ir_builder: Arc<dyn IrBuilder>, config: OverlayConfig) -> Self {
        Self { ir_builder, config }
    }

    /// Build an overlay snapshot from `uncommitted_files` (path → content).
    #[tracing::instrument(skip_all, fields(base_snapshot_id, num_uncommitted = uncommitted_files.len()))]
    pub fn build_overlay(
        &self,
        base_snapshot_id: &str,
        repo_id: &str,
        uncommitted_files: &BTreeMap<String, String>,
        base_ir_docs: Option<&BTreeMap<String, IrDocument>>,
    ) -> OverlaySnapshot {
        // Cap is a ceiling, not a sampling guarantee: excess files are
        // dropped in iteration order.
        let capped: BTreeMap<&String, &String> = uncommitted_files
            .iter()
            .take(self.config.max_overlay_files)
            .collect();
        if capped.len() < uncommitted_files.len() {
            tracing::warn!(
                count = uncommitted_files.len(),
                max = self.config.max_overlay_files,
                "too many uncommitted files, truncating"
            );
        }

        let mut overlay = OverlaySnapshot::new(
            generate_overlay_id(base_snapshot_id, &capped),
            base_snapshot_id,
            repo_id,
        );

        for (path, content) in &capped {
            self.process_uncommitted_file(&mut overlay, path, content, base_ir_docs);
        }

        tracing::info!(
            snapshot_id = %overlay.snapshot_id,
            num_ir_docs = overlay.overlay_ir_docs.len(),
            num_affected_symbols = overlay.affected_symbols.len(),
            "overlay built"
        );
        overlay
    }

    fn process_uncommitted_file(
        &self,
        overlay: &mut OverlaySnapshot,
        file_path: &str,
        content: &str,
        base_ir_docs: Option<&BTreeMap<String, IrDocument>>,
    ) {
        let is_new = base_ir_docs.map_or(true, |base| !base.contains_key(file_path));
        overlay.add_uncommitted_file(UncommittedFile {
            file_path: file_path.to_string(),
            content: content.to_string(),
            timestamp: SystemTime::now(),
            content_hash: sha256_hex(content),
            is_new,
            is_deleted: false,
        });

        let ir_doc = match self.ir_builder.build_file_ir(file_path, content) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(file_path, error = %e, "ir build failed, skipping file");
                return;
            }
        };

        match base_ir_docs.and_then(|base| base.get(file_path)) {
            Some(base_ir) => {
                for symbol_id in compute_affected_symbols(base_ir, &ir_doc) {
                    overlay.mark_affected_symbol(symbol_id);
                }
            }
            None => {
                // New file: every symbol is affected.
                for symbol in &ir_doc.symbols {
                    overlay.mark_affected_symbol(symbol.id.clone());
                }
            }
        }

        overlay.overlay_ir_docs.insert(file_path.to_string(), ir_doc);
    }
}

/// Symbols whose identity, signature, or range differs between base and
/// overlay IR of one file.
fn compute_affected_symbols(base_ir: &IrDocument, overlay_ir: &IrDocument) -> BTreeSet<String> {
    let base: BTreeMap<&str, _> = base_ir.symbols.iter().map(|s| (s.id.as_str(), s)).collect();
    let over: BTreeMap<&str, _> = overlay_ir.symbols.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut affected = BTreeSet::new();

    for id in base.keys() {
        if !over.contains_key(id) {
            affected.insert(id.to_string());
        }
    }
    for id in over.keys() {
        if !base.contains_key(id) {
            affected.insert(id.to_string());
        }
    }
    for (id, base_sym) in &base {
        let Some(over_sym) = over.get(id) else { continue };
        if base_sym.signature != over_sym.signature {
            tracing::debug!(
                symbol_id = id,
                old = ?base_sym.signature,
                new = ?over_sym.signature,
                "signature changed"
            );
            affected.insert(id.to_string());
        } else if base_sym.range != over_sym.range {
            // Range movement is the body-change heuristic.
            affected.insert(id.to_string());
        }
    }

    affected
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `overlay_` + first 16 hex digits of
/// SHA-256(base_snapshot_id ∥ Σ sorted(path ∥ sha256_hex(content))).
fn generate_overlay_id(base_snapshot_id: &str, files: &BTreeMap<&String, &String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_snapshot_id.as_bytes());
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update(sha256_hex(content).as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("overlay_{}", &digest[..16])
}
