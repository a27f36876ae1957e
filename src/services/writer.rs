//! Collection lifecycle for one embedding run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::vector_store::VectorStore;
use crate::error::{ConfigError, PipelineError, VectorStoreError};
use crate::models::{CollectionManifest, EmbeddingRecord};
use crate::utils::{RetryConfig, RetryResult, Retryable, with_retry};

/// What [`VectorStoreWriter::finalize`] did.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub name: String,
    pub collection: String,
    pub document_count: u64,
    /// Physical collection the alias pointed at before, now deleted.
    pub replaced: Option<String>,
}

pub struct VectorStoreWriter {
    store: Arc<dyn VectorStore>,
    retry: RetryConfig,
}

impl VectorStoreWriter {
    /// `write_retries` counts retries after the first attempt.
    pub fn new(store: Arc<dyn VectorStore>, write_retries: u32) -> Self {
        Self {
            store,
            retry: RetryConfig::new(write_retries.saturating_add(1))
                .with_initial_delay(Duration::from_millis(200))
                .with_max_delay(Duration::from_secs(5)),
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Create the physical collection with its draft manifest, or validate an
    /// existing one when resuming.
    pub async fn ensure_collection(
        &self,
        manifest: &CollectionManifest,
    ) -> Result<(), PipelineError> {
        let name = &manifest.collection;
        match self.store.collection_info(name).await? {
            Some(info) => {
                if info.dimension != manifest.dimensionality {
                    return Err(ConfigError::DimensionMismatch {
                        collection: name.clone(),
                        existing: info.dimension,
                        requested: manifest.dimensionality,
                    }
                    .into());
                }
                info!(collection = %name, points = info.points_count, "reusing existing collection");
                if self.store.get_manifest(name).await?.is_none() {
                    self.store.put_manifest(manifest).await?;
                }
            }
            None => {
                self.store
                    .create_collection(name, manifest.dimensionality)
                    .await?;
                self.store.put_manifest(manifest).await?;
                info!(
                    collection = %name,
                    dimension = manifest.dimensionality,
                    "created collection"
                );
            }
        }
        Ok(())
    }

    /// Idempotent upsert with bounded retries on transient store failures.
    pub async fn write_batch(
        &self,
        collection: &str,
        records: &[EmbeddingRecord],
    ) -> Result<(), PipelineError> {
        let result = with_retry(&self.retry, || {
            self.store.upsert(collection, records.to_vec())
        })
        .await;

        match result {
            RetryResult::Success(()) => Ok(()),
            RetryResult::Failed {
                last_error,
                attempts,
            } if last_error.is_retryable() => Err(PipelineError::TransientResource {
                attempts,
                message: last_error.to_string(),
            }),
            RetryResult::Failed { last_error, .. } => Err(last_error.into()),
        }
    }

    /// Verify the collection, mark its manifest complete, repoint the logical
    /// name, and only then delete the collection it replaced.
    pub async fn finalize(
        &self,
        manifest: &mut CollectionManifest,
        expected_documents: u64,
    ) -> Result<FinalizeReport, PipelineError> {
        let collection = manifest.collection.clone();
        let info = self.store.collection_info(&collection).await?.ok_or_else(|| {
            PipelineError::StorageIntegrity(format!("collection '{collection}' disappeared"))
        })?;

        if info.dimension != manifest.dimensionality {
            return Err(PipelineError::StorageIntegrity(format!(
                "collection '{}' has dimension {}, manifest says {}",
                collection, info.dimension, manifest.dimensionality
            )));
        }
        if info.points_count != expected_documents {
            return Err(PipelineError::StorageIntegrity(format!(
                "collection '{}' holds {} records, expected {} unique documents",
                collection, info.points_count, expected_documents
            )));
        }

        manifest.document_count = info.points_count;
        manifest.finalized_at = Some(Utc::now());
        self.store.put_manifest(manifest).await?;

        let replaced = self.store.set_alias(&manifest.name, &collection).await?;
        if let Some(ref old) = replaced {
            match self.store.delete_collection(old).await {
                Ok(()) => info!(old = %old, "deleted replaced collection"),
                Err(e) => warn!(old = %old, "failed to delete replaced collection: {e}"),
            }
        }

        info!(
            name = %manifest.name,
            collection = %collection,
            documents = info.points_count,
            "collection finalized"
        );

        Ok(FinalizeReport {
            name: manifest.name.clone(),
            collection,
            document_count: info.points_count,
            replaced,
        })
    }

    /// Delete a physical collection that never got finalized.
    pub async fn discard(&self, collection: &str) -> Result<(), VectorStoreError> {
        self.store.delete_collection(collection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, EmbeddingTask};
    use crate::services::vector_store::SqliteBackend;

    fn writer() -> (tempfile::TempDir, VectorStoreWriter) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteBackend::open(&dir.path().join("v.db")).unwrap();
        (dir, VectorStoreWriter::new(Arc::new(store), 3))
    }

    fn records(ids: &[&str]) -> Vec<EmbeddingRecord> {
        ids.iter()
            .map(|id| EmbeddingRecord::from_document(Document::new(*id, "t", "s"), vec![1.0, 0.0]))
            .collect()
    }

    fn manifest(collection: &str, dim: usize) -> CollectionManifest {
        CollectionManifest::new("docs", collection, "m", EmbeddingTask::RetrievalPassage, dim)
    }

    #[tokio::test]
    async fn test_ensure_collection_detects_dimension_mismatch() {
        let (_dir, writer) = writer();
        writer.ensure_collection(&manifest("docs__1", 2)).await.unwrap();
        writer.ensure_collection(&manifest("docs__1", 2)).await.unwrap();

        let err = writer
            .ensure_collection(&manifest("docs__1", 3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Configuration(ConfigError::DimensionMismatch { existing: 2, requested: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_finalize_replaces_previous_only_after_success() {
        let (_dir, writer) = writer();
        let store = writer.store().clone();

        let mut first = manifest("docs__1", 2);
        writer.ensure_collection(&first).await.unwrap();
        writer.write_batch("docs__1", &records(&["a", "b"])).await.unwrap();
        writer.finalize(&mut first, 2).await.unwrap();
        assert_eq!(store.resolve_alias("docs").await.unwrap().as_deref(), Some("docs__1"));

        // A second run whose verification fails leaves the first one in place.
        let mut second = manifest("docs__2", 2);
        writer.ensure_collection(&second).await.unwrap();
        writer.write_batch("docs__2", &records(&["a"])).await.unwrap();
        let err = writer.finalize(&mut second, 2).await.unwrap_err();
        assert!(matches!(err, PipelineError::StorageIntegrity(_)));
        assert_eq!(store.resolve_alias("docs").await.unwrap().as_deref(), Some("docs__1"));
        assert!(store.collection_info("docs__1").await.unwrap().is_some());

        writer.write_batch("docs__2", &records(&["b", "c"])).await.unwrap();
        let report = writer.finalize(&mut second, 3).await.unwrap();
        assert_eq!(report.replaced.as_deref(), Some("docs__1"));
        assert_eq!(report.document_count, 3);
        assert!(store.collection_info("docs__1").await.unwrap().is_none());

        let stored = store.get_manifest("docs__2").await.unwrap().unwrap();
        assert!(stored.is_complete());
        assert_eq!(stored.document_count, 3);
    }

    #[tokio::test]
    async fn test_write_batch_twice_is_idempotent() {
        let (_dir, writer) = writer();
        writer.ensure_collection(&manifest("docs__1", 2)).await.unwrap();
        let batch = records(&["a", "b", "c"]);
        writer.write_batch("docs__1", &batch).await.unwrap();
        writer.write_batch("docs__1", &batch).await.unwrap();

        let info = writer.store().collection_info("docs__1").await.unwrap().unwrap();
        assert_eq!(info.points_count, 3);
    }

    #[test]
    fn test_write_retries_follow_the_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VectorStore> =
            Arc::new(SqliteBackend::open(&dir.path().join("v.db")).unwrap());
        assert_eq!(VectorStoreWriter::new(store.clone(), 0).retry.max_attempts, 1);
        assert_eq!(VectorStoreWriter::new(store, 2).retry.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_write_to_missing_collection_fails_without_retry() {
        let (_dir, writer) = writer();
        let err = writer.write_batch("nope", &records(&["a"])).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::VectorStore(VectorStoreError::NotFound(_))
        ));
    }
}
