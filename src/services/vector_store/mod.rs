//! Vector store abstraction layer.
//!
//! This module provides a trait-based abstraction over the vector store
//! backends (embedded SQLite, Qdrant). Collections are addressed by name;
//! logical names are aliases that point at a physical collection.

mod qdrant;
mod sqlite;

pub use qdrant::QdrantBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;

use crate::error::VectorStoreError;
use crate::models::{CollectionManifest, EmbeddingRecord, QueryHit, VectorDriver, VectorStoreConfig};

/// Collection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub points_count: u64,
    pub dimension: usize,
}

/// Abstract trait for vector store operations.
///
/// All vector store backends must implement this trait to enable
/// backend-agnostic vector operations throughout the application.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Check if the vector store is healthy and accessible.
    async fn health_check(&self) -> Result<bool, VectorStoreError>;

    /// Returns None if the collection doesn't exist.
    async fn collection_info(&self, name: &str)
    -> Result<Option<CollectionInfo>, VectorStoreError>;

    /// Create a cosine-distance collection. Creating an existing collection is a no-op.
    async fn create_collection(&self, name: &str, dimension: usize)
    -> Result<(), VectorStoreError>;

    /// Delete a collection together with its manifest.
    async fn delete_collection(&self, name: &str) -> Result<(), VectorStoreError>;

    /// Physical collection names.
    async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError>;

    /// Insert or replace records keyed by document id.
    async fn upsert(
        &self,
        collection: &str,
        records: Vec<EmbeddingRecord>,
    ) -> Result<(), VectorStoreError>;

    /// The `limit` nearest records by cosine distance, closest first.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<QueryHit>, VectorStoreError>;

    /// All document ids in the collection, sorted.
    async fn list_ids(&self, collection: &str) -> Result<Vec<String>, VectorStoreError>;

    /// Records for `ids`, in the order given. Unknown ids are skipped.
    async fn fetch(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<EmbeddingRecord>, VectorStoreError>;

    async fn put_manifest(&self, manifest: &CollectionManifest) -> Result<(), VectorStoreError>;

    async fn get_manifest(
        &self,
        collection: &str,
    ) -> Result<Option<CollectionManifest>, VectorStoreError>;

    /// Point `alias` at `collection`, returning the previous target.
    async fn set_alias(
        &self,
        alias: &str,
        collection: &str,
    ) -> Result<Option<String>, VectorStoreError>;

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, VectorStoreError>;

    async fn delete_alias(&self, alias: &str) -> Result<(), VectorStoreError>;

    /// `(alias, collection)` pairs, sorted by alias.
    async fn list_aliases(&self) -> Result<Vec<(String, String)>, VectorStoreError>;

    /// Human-readable location (database path or URL).
    fn location(&self) -> String;
}

/// Resolve a user-supplied name: aliases first, then physical collections.
pub async fn resolve_collection(
    store: &dyn VectorStore,
    name: &str,
) -> Result<Option<String>, VectorStoreError> {
    if let Some(target) = store.resolve_alias(name).await? {
        return Ok(Some(target));
    }
    Ok(store
        .collection_info(name)
        .await?
        .map(|info| info.name))
}

/// Create a vector store backend based on configuration.
pub async fn create_backend(
    config: &VectorStoreConfig,
) -> Result<Box<dyn VectorStore>, VectorStoreError> {
    match config.driver {
        VectorDriver::Sqlite => {
            let backend = SqliteBackend::open(&config.db_path)?;
            Ok(Box::new(backend))
        }
        VectorDriver::Qdrant => {
            let backend = QdrantBackend::new(config)?;
            Ok(Box::new(backend))
        }
    }
}

/// Cosine distance (`1 - cosine similarity`). Zero vectors are maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[tokio::test]
    async fn test_resolve_collection_prefers_alias() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteBackend::open(&dir.path().join("v.db")).unwrap();
        store.create_collection("docs__1", 2).await.unwrap();
        store.create_collection("plain", 2).await.unwrap();
        store.set_alias("docs", "docs__1").await.unwrap();

        assert_eq!(
            resolve_collection(&store, "docs").await.unwrap().as_deref(),
            Some("docs__1")
        );
        assert_eq!(
            resolve_collection(&store, "plain").await.unwrap().as_deref(),
            Some("plain")
        );
        assert!(resolve_collection(&store, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_backend_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = VectorStoreConfig {
            db_path: dir.path().join("nested").join("store.db"),
            ..Default::default()
        };
        let store = create_backend(&config).await.unwrap();
        assert!(store.health_check().await.unwrap());
        assert!(store.location().ends_with("store.db"));
    }
}
