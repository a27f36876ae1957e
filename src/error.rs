//! Error types for the embedding pipeline and analysis engine.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::utils::retry::Retryable;

/// Errors related to configuration. Always fatal, raised before processing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("path error: {0}")]
    PathError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("input file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error(
        "dimension mismatch for collection '{collection}': existing {existing}, requested {requested}"
    )]
    DimensionMismatch {
        collection: String,
        existing: usize,
        requested: usize,
    },
}

/// A corpus line that could not be turned into a document.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("malformed record at line {line}: {reason}")]
pub struct MalformedRecordError {
    /// 1-based line number.
    pub line: u64,
    pub reason: String,
}

/// Errors raised while reading the corpus.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to open corpus {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read error at line {line}: {source}")]
    Read {
        line: u64,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),

    #[error("duplicate document id '{id}' at line {line}")]
    DuplicateId { id: String, line: u64 },
}

/// Errors related to embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("embedding input rejected: {0}")]
    InvalidInput(String),

    #[error("failed to connect to embedding server: {0}")]
    ConnectionError(String),

    #[error("embedding server error: {0}")]
    ServerError(String),

    #[error("embedding request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding timeout")]
    Timeout,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("failed to load model: {0}")]
    LoadError(String),

    #[error("tokenizer error: {0}")]
    TokenizerError(String),

    #[error("inference error: {0}")]
    InferenceError(String),
}

impl EmbeddingError {
    /// Classify a runtime error message from the inference engine.
    pub fn from_inference_message(msg: String) -> Self {
        if is_memory_message(&msg) {
            EmbeddingError::ResourceExhausted(msg)
        } else {
            EmbeddingError::InferenceError(msg)
        }
    }
}

pub(crate) fn is_memory_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("out of memory")
        || lower.contains("failed to allocate")
        || lower.contains("bad_alloc")
        || lower.contains("cuda_error_out_of_memory")
        || lower.contains("cudnn_status_alloc_failed")
        || lower.contains("insufficient memory")
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::ResourceExhausted(_)
            | EmbeddingError::ConnectionError(_)
            | EmbeddingError::Timeout => true,
            EmbeddingError::ServerError(msg) => {
                msg.contains("503")
                    || msg.contains("502")
                    || msg.contains("504")
                    || msg.contains("429")
                    || msg.to_lowercase().contains("unavailable")
                    || msg.to_lowercase().contains("too many requests")
            }
            EmbeddingError::RequestError(e) => e.is_timeout() || e.is_connect(),
            EmbeddingError::InvalidInput(_)
            | EmbeddingError::InvalidResponse(_)
            | EmbeddingError::ModelNotFound(_)
            | EmbeddingError::LoadError(_)
            | EmbeddingError::TokenizerError(_)
            | EmbeddingError::InferenceError(_) => false,
        }
    }
}

/// Errors related to vector store operations.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("failed to connect to vector store: {0}")]
    ConnectionError(String),

    #[error("collection error: {0}")]
    CollectionError(String),

    #[error("collection not found: {0}")]
    NotFound(String),

    #[error("upsert error: {0}")]
    UpsertError(String),

    #[error("search error: {0}")]
    SearchError(String),

    #[error("delete error: {0}")]
    DeleteError(String),

    #[error("vector store client error: {0}")]
    ClientError(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl Retryable for VectorStoreError {
    fn is_retryable(&self) -> bool {
        match self {
            VectorStoreError::ConnectionError(_) => true,
            VectorStoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            VectorStoreError::CollectionError(msg)
            | VectorStoreError::UpsertError(msg)
            | VectorStoreError::SearchError(msg)
            | VectorStoreError::DeleteError(msg)
            | VectorStoreError::ClientError(msg) => {
                let msg_lower = msg.to_lowercase();
                msg_lower.contains("timeout")
                    || msg_lower.contains("connection")
                    || msg_lower.contains("unavailable")
                    || msg_lower.contains("too many")
            }
            VectorStoreError::NotFound(_)
            | VectorStoreError::Sqlite(_)
            | VectorStoreError::Encoding(_) => false,
        }
    }
}

/// Errors related to checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("checkpoint belongs to a different run: {0}")]
    Mismatch(String),
}

/// Fatal outcomes of an embedding run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("corpus error: {0}")]
    Loader(#[from] LoaderError),

    #[error("transient failure persisted after {attempts} attempts: {message}")]
    TransientResource { attempts: u32, message: String },

    #[error("storage integrity error: {0}")]
    StorageIntegrity(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Errors related to embedding-space analysis.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection '{0}' has not been finalized")]
    Incomplete(String),

    #[error("collection '{0}' is empty")]
    Empty(String),

    #[error("inconsistent vectors: {0}")]
    InconsistentVectors(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("analysis worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
