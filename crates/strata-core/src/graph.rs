use serde::{Deserialize, Serialize};

/// A symbol node in a graph document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub symbol_id: String,
    pub name: String,
    /// Dot-separated fully qualified name.
    pub fqn: String,
    pub kind: Option<String>,
    pub file_path: String,
    /// 0-indexed, end-exclusive.
    pub start_line: u32,
    pub end_line: u32,
    pub signature: Option<String>,
}

/// A caller → callee edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEdge {
    pub caller_id: String,
    pub callee_id: String,
}

/// A file → module import edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEdge {
    pub importer_path: String,
    pub module: String,
}

/// Symbol-graph payload for one (repo, snapshot), produced by the upstream
/// analysis layer and fed to the symbol index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    pub nodes: Vec<GraphNode>,
    pub call_edges: Vec<CallEdge>,
    pub import_edges: Vec<ImportEdge>,
}
