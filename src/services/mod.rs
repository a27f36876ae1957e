pub mod batcher;
pub mod checkpoint;
pub mod embedding;
pub mod loader;
pub mod monitor;
pub mod pipeline;
pub mod validator;
pub mod vector_store;
pub mod writer;

pub use batcher::{AdaptiveBatchSizer, BatchOrchestrator, BatchOutcome, BatchSizing};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use embedding::{EmbedOptions, Embedder, Embeddings, SharedEmbedder, create_embedder};
pub use loader::{LoaderOptions, LoaderStats, RecordLoader, parse_record};
pub use monitor::{ResourceMonitor, ResourceSnapshot};
pub use pipeline::{EmbeddingPipeline, RunCounts, RunError, RunOptions, RunSummary};
pub use validator::{ValidationReport, validate_corpus};
pub use vector_store::{CollectionInfo, VectorStore, create_backend, resolve_collection};
pub use writer::VectorStoreWriter;
