//! Collection naming and manifests.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::EmbeddingTask;

/// Upper bound on collection name length (kept compatible with common stores).
pub const MAX_COLLECTION_NAME_LEN: usize = 63;

/// Separator between a logical name and the run stamp of its physical collection.
pub const GENERATION_SEPARATOR: &str = "__";

/// Manifest stored alongside every physical collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionManifest {
    /// Logical name users refer to.
    pub name: String,
    /// Physical collection holding the records.
    pub collection: String,
    pub document_count: u64,
    pub model_name: String,
    pub task: EmbeddingTask,
    pub dimensionality: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl CollectionManifest {
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        model_name: impl Into<String>,
        task: EmbeddingTask,
        dimensionality: usize,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            document_count: 0,
            model_name: model_name.into(),
            task,
            dimensionality,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.finalized_at.is_some()
    }
}

/// `<input stem>_<model short name>`, restricted to `[A-Za-z0-9._-]` and
/// truncated to [`MAX_COLLECTION_NAME_LEN`].
pub fn derive_collection_name(input: &Path, model_short_name: &str) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "corpus".to_string());

    let raw = format!("{stem}_{model_short_name}");
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_COLLECTION_NAME_LEN)
        .collect();

    sanitized
}

/// Physical collection for one run of a logical collection.
pub fn physical_collection_name(logical: &str, stamp: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        logical,
        GENERATION_SEPARATOR,
        stamp.format("%Y%m%d%H%M%S%3f")
    )
}
