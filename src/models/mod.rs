mod collection;
mod config;
mod document;
mod output;
mod task;

pub use collection::{
    CollectionManifest, GENERATION_SEPARATOR, MAX_COLLECTION_NAME_LEN, derive_collection_name,
    physical_collection_name,
};
pub use config::{
    AnalysisConfig, BatchingConfig, CheckpointConfig, Config, DEFAULT_CHECKPOINT_DIR,
    DEFAULT_DB_PATH, DEFAULT_EMBEDDING_URL, DEFAULT_MANIFEST_PATH, DEFAULT_MODEL,
    DEFAULT_MODEL_DIMENSION, DEFAULT_QDRANT_URL, DEFAULT_VISUALIZATION_DIR, DuplicatePolicy,
    EmbeddingBackend, EmbeddingConfig, InputConfig, LoadedConfig, MalformedPolicy, MonitorConfig,
    OutputConfig, PROJECT_CONFIG_FILE, VectorDriver, VectorStoreConfig,
};
pub use document::{Document, EmbeddingRecord, Metadata, MetadataValue, QueryHit};
pub use output::OutputFormat;
pub use task::{Device, EmbeddingTask};
