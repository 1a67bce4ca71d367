use crate::models::{ConflictKind, ConflictResolution, SymbolConflict};

/// Risk level of a set of conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Resolves symbol conflicts between base and overlay.
///
/// Strategy: overlay always wins -- what the developer is editing right now
/// is what IDE/agent queries should see. Conflicts stay visible as data on
/// the merged snapshot.
#[derive(Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn resolve(&self, mut conflict: SymbolConflict) -> SymbolConflict {
        conflict.resolution = ConflictResolution::OverlayWins;
        tracing::debug!(
            symbol_id = %conflict.symbol_id,
            kind = conflict.kind.name(),
            is_breaking = conflict.is_breaking_change(),
            "conflict resolved"
        );
        conflict
    }

    /// Coarse risk assessment over a set of conflicts.
    pub fn assess_risk(&self, conflicts: &[SymbolConflict]) -> RiskLevel {
        let breaking = conflicts.iter().filter(|c| c.is_breaking_change()).count();
        if breaking > 5 {
            RiskLevel::High
        } else if breaking > 0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Human-readable warnings for breaking conflicts.
    pub fn generate_warnings(&self, conflicts: &[SymbolConflict]) -> Vec<String> {
        conflicts
            .iter()
            .filter(|c| c.is_breaking_change())
            .map(|c| match c.kind {
                ConflictKind::Deletion => format!(
                    "Symbol '{}' was deleted. This may break code that depends on it.",
                    c.symbol_id
                ),
                _ => format!(
                    "Signature of '{}' changed: {} -> {}. This may be a breaking change.",
                    c.symbol_id,
                    c.base_signature.as_deref().unwrap_or("?"),
                    c.overlay_signature.as_deref().unwrap_or("?"),
                ),
            })
            .collect()
    }
}
