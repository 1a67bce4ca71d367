mod builder;
mod error;
mod merger;
mod models;
mod resolver;

pub use builder::{IrBuilder, OverlayBuilder};
pub use error::OverlayError;
pub use merger::{BaseGraphSource, GraphMerger, InvalidationComputer};
pub use models::{
    ConflictKind, ConflictResolution, MergedSnapshot, MergedSymbol, OverlayConfig,
    OverlaySnapshot, SymbolConflict, SymbolLocation, UncommittedFile,
};
pub use resolver::{ConflictResolver, RiskLevel};
