pub mod fuzzy;
pub mod lexical;
pub mod symbol;
pub mod vector;

pub use fuzzy::TrigramFuzzyIndex;
pub use lexical::MergingLexicalIndex;
pub use symbol::{GraphStoreSource, SqliteSymbolIndex};
pub use vector::{is_domain_doc, DomainDocIndex, HashEmbedder, UsearchVectorIndex};
