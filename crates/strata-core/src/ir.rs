use serde::{Deserialize, Serialize};

use crate::language::Language;

/// Line/column span of an IR symbol. 0-indexed, end-exclusive lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IrRange {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

/// A call edge recorded on an IR symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrCall {
    /// Symbol ID of the callee.
    pub target_id: String,
}

/// An import recorded on an IR document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrImport {
    /// Imported module path (e.g., "src.utils").
    pub module: String,
}

/// A symbol in an IR document.
///
/// `id` is the parser's stable symbol identifier (typically the dotted FQN,
/// e.g. "src.utils.calculate"). Fields the parser may omit are explicit
/// options here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrSymbol {
    pub id: String,
    pub name: String,
    pub kind: Option<String>,
    pub signature: Option<String>,
    pub range: IrRange,
    pub calls: Vec<IrCall>,
}

impl IrSymbol {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: None,
            signature: None,
            range: IrRange::default(),
            calls: Vec::new(),
        }
    }
}

/// Parsed representation of one source file, produced by the external
/// IR builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrDocument {
    pub file_path: String,
    pub language: Option<Language>,
    pub symbols: Vec<IrSymbol>,
    pub imports: Vec<IrImport>,
}

impl IrDocument {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    /// Look up a symbol by ID.
    pub fn symbol(&self, id: &str) -> Option<&IrSymbol> {
        self.symbols.iter().find(|s| s.id == id)
    }
}
