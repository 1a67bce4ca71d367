pub mod adapters;
pub mod compaction;
pub mod error;
pub mod filter;
pub mod ports;
pub mod queue;
pub mod service;
pub mod transformer;
pub mod version;

pub use compaction::{CompactionManager, CompactionState};
pub use error::IndexError;
pub use ports::{
    DeltaWriter, DomainMetaIndexPort, EmbeddingProvider, FileQueue, FuzzyIndexPort,
    LexicalIndexPort, RepoRootResolver, RuntimeIndexPort, SingleFileIndexer, StaticRepoRoots,
    SymbolIndexPort, VectorIndexPort,
};
pub use queue::{EmbeddingQueue, EmbeddingWorkerPool, PoolStats, WorkSignal};
pub use service::{
    default_weights, fuse_hits, ChunkRefreshResult, IncrementalIndexingResult, IncrementalStatus,
    IndexingPhaseResult, IndexingService, InMemoryFileQueue, Phase2Task, QueuedFileBatch,
    ServiceConfig,
};
pub use transformer::{IndexDocumentTransformer, RepoMapSnapshot};
pub use version::{
    IndexVersionChecker, ReindexTrigger, StalenessPolicy, VersionCheckMiddleware,
    VersionCheckResult,
};
