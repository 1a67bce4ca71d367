//! End-to-end overlay flows: build an overlay from edited files, merge it
//! with a base snapshot, and inspect conflicts and breaking changes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use strata_core::{IrDocument, IrRange, IrSymbol};
use strata_overlay::{
    ConflictKind, GraphMerger, IrBuilder, OverlayBuilder, OverlayConfig, OverlayError, RiskLevel,
    ConflictResolver,
};

/// Line-oriented stand-in for the external parser: each `def name(sig)` line
/// becomes a function symbol with ID `<module>.<name>` and the parenthesized
/// signature.
struct LineIrBuilder;

impl IrBuilder for LineIrBuilder {
    fn build_file_ir(&self, file_path: &str, content: &str) -> Result<IrDocument, OverlayError> {
        let module = file_path.trim_end_matches(".py").replace('/', ".");
        let mut doc = IrDocument::new(file_path);
        for (line_no, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            let Some(rest) = trimmed.strip_prefix("def ") else { continue };
            let Some(paren) = rest.find('(') else { continue };
            let name = &rest[..paren];
            let mut sym = IrSymbol::new(format!("{module}.{name}"), name);
            sym.signature = Some(rest[paren..].trim_end_matches(':').to_string());
            sym.range = IrRange {
                start_line: line_no as u32,
                start_col: 0,
                end_line: line_no as u32 + 1,
                end_col: 0,
            };
            doc.symbols.push(sym);
        }
        Ok(doc)
    }
}

fn base_ir(path: &str, content: &str) -> BTreeMap<String, IrDocument> {
    let doc = LineIrBuilder.build_file_ir(path, content).unwrap();
    [(path.to_string(), doc)].into_iter().collect()
}

fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(p, c)| (p.to_string(), c.to_string()))
        .collect()
}

fn builder() -> OverlayBuilder {
    OverlayBuilder::new(Arc::new(LineIrBuilder), OverlayConfig::default())
}

fn merger() -> GraphMerger {
    GraphMerger::new(None, Duration::from_secs(60))
}

#[test]
fn signature_widening_is_tracked_but_not_breaking() {
    // Base: calculate(x, y); overlay adds a parameter.
    let base = base_ir("src/utils.py", "def calculate(x: int, y: int) -> int:\n    pass");
    let edited = files(&[(
        "src/utils.py",
        "def calculate(x: int, y: int, z: int) -> int:\n    pass",
    )]);

    let mut overlay = builder().build_overlay("base_snap", "r1", &edited, Some(&base));
    assert!(overlay.affected_symbols.contains("src.utils.calculate"));

    let merged = merger().merge_graphs("base_snap", &mut overlay, &base);

    let symbol = merged.get_symbol("src.utils.calculate").unwrap();
    assert_eq!(
        symbol.symbol.signature.as_deref(),
        Some("(x: int, y: int, z: int) -> int")
    );
    assert_eq!(symbol.file_path, "src/utils.py");

    assert_eq!(merged.conflicts.len(), 1);
    let conflict = &merged.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::SignatureChange);
    // The new signature is longer, so the heuristic does not flag it.
    assert!(!conflict.is_breaking_change());
    assert!(merged.breaking_changes().is_empty());
}

#[test]
fn parameter_removal_is_breaking() {
    let base = base_ir(
        "src/api.py",
        "def process_user(user: User, role: str) -> None:\n    pass",
    );
    let edited = files(&[("src/api.py", "def process_user(user: User) -> None:\n    pass")]);

    let mut overlay = builder().build_overlay("base_snap", "r1", &edited, Some(&base));
    let merged = merger().merge_graphs("base_snap", &mut overlay, &base);

    assert_eq!(merged.conflicts.len(), 1);
    let conflict = &merged.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::SignatureChange);
    assert!(conflict.is_breaking_change());
    assert_eq!(merged.breaking_changes().len(), 1);

    let resolver = ConflictResolver;
    assert_eq!(resolver.assess_risk(&merged.conflicts), RiskLevel::Medium);
    let warnings = resolver.generate_warnings(&merged.conflicts);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("src.api.process_user"));
}

#[test]
fn overlay_id_depends_only_on_base_and_contents() {
    let edited = files(&[
        ("src/a.py", "def one(): pass"),
        ("src/b.py", "def two(): pass"),
    ]);
    let o1 = builder().build_overlay("base_snap", "r1", &edited, None);
    let o2 = builder().build_overlay("base_snap", "r1", &edited, None);
    assert_eq!(o1.snapshot_id, o2.snapshot_id);

    let other_base = builder().build_overlay("other_snap", "r1", &edited, None);
    assert_ne!(o1.snapshot_id, other_base.snapshot_id);

    let mut merged1 = o1;
    let merged = merger().merge_graphs("base_snap", &mut merged1, &BTreeMap::new());
    assert_eq!(merged.snapshot_id, format!("merged_{}", merged1.snapshot_id));
}

#[test]
fn deleted_file_symbols_surface_as_deletions() {
    // The overlay rewrites the file without one of the base functions.
    let base = base_ir(
        "src/store.py",
        "def save(item): pass\ndef load(key): pass",
    );
    let edited = files(&[("src/store.py", "def save(item): pass")]);

    let mut overlay = builder().build_overlay("base_snap", "r1", &edited, Some(&base));
    assert!(overlay.affected_symbols.contains("src.store.load"));

    let merged = merger().merge_graphs("base_snap", &mut overlay, &base);
    assert!(merged.get_symbol("src.store.load").is_none());
    assert!(merged.get_symbol("src.store.save").is_some());

    let deletions: Vec<_> = merged
        .conflicts
        .iter()
        .filter(|c| c.kind == ConflictKind::Deletion)
        .collect();
    assert_eq!(deletions.len(), 1);
    assert!(deletions[0].is_breaking_change());
}
