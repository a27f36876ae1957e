//! Durable run progress.
//!
//! A checkpoint records which document ids have been embedded and written for
//! one logical collection. It is persisted after every committed batch by
//! writing a temporary file, syncing it, and renaming it over the previous one.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::CheckpointError;
use crate::models::EmbeddingTask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identity of the run configuration this checkpoint belongs to.
    pub run_key: String,
    /// Logical collection name.
    pub name: String,
    /// Physical collection receiving the records.
    pub collection_name: String,
    pub model_name: String,
    pub task: EmbeddingTask,
    pub processed_ids: BTreeSet<String>,
    /// Last corpus line covered by a committed batch.
    pub last_offset: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn fresh(
        run_key: impl Into<String>,
        name: impl Into<String>,
        collection_name: impl Into<String>,
        model_name: impl Into<String>,
        task: EmbeddingTask,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_key: run_key.into(),
            name: name.into(),
            collection_name: collection_name.into(),
            model_name: model_name.into(),
            task,
            processed_ids: BTreeSet::new(),
            last_offset: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stable key over everything that changes the content of the vectors.
    pub fn run_key(
        input: &Path,
        model_name: &str,
        task: EmbeddingTask,
        truncate_dim: Option<usize>,
    ) -> String {
        let canonical = input
            .canonicalize()
            .unwrap_or_else(|_| input.to_path_buf());
        let material = format!(
            "{}\n{}\n{}\n{}",
            canonical.display(),
            model_name,
            task,
            truncate_dim.map(|d| d.to_string()).unwrap_or_default()
        );
        let hash = Sha256::digest(material.as_bytes());
        hex::encode(&hash[..16])
    }

    pub fn processed_count(&self) -> usize {
        self.processed_ids.len()
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed_ids.contains(id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Loads and atomically persists the checkpoint of one logical collection.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.checkpoint.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last durable checkpoint, if any.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let checkpoint = Checkpoint::from_bytes(&bytes)?;
                debug!(
                    path = %self.path.display(),
                    processed = checkpoint.processed_count(),
                    "loaded checkpoint"
                );
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Checkpoint to continue from: the stored one when it matches `fresh`'s
    /// run key, otherwise `fresh`.
    pub fn load_or(&self, fresh: Checkpoint) -> Result<Checkpoint, CheckpointError> {
        match self.load()? {
            Some(existing) if existing.run_key == fresh.run_key => {
                info!(
                    processed = existing.processed_count(),
                    collection = %existing.collection_name,
                    "resuming from checkpoint"
                );
                Ok(existing)
            }
            Some(existing) => Err(CheckpointError::Mismatch(format!(
                "{} was written for model '{}' task '{}'; remove it or pass --restart",
                self.path.display(),
                existing.model_name,
                existing.task
            ))),
            None => Ok(fresh),
        }
    }

    /// Record a committed batch and persist the result.
    pub fn commit<I>(
        &self,
        checkpoint: &mut Checkpoint,
        ids: I,
        last_offset: u64,
    ) -> Result<(), CheckpointError>
    where
        I: IntoIterator<Item = String>,
    {
        checkpoint.processed_ids.extend(ids);
        checkpoint.last_offset = checkpoint.last_offset.max(last_offset);
        checkpoint.updated_at = Utc::now();
        self.persist(checkpoint)
    }

    /// Write-then-rename so a crash never leaves a partial file behind.
    pub fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&checkpoint.to_bytes()?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        #[cfg(unix)]
        if let Ok(dir_handle) = File::open(dir)
            && let Err(e) = dir_handle.sync_all()
        {
            debug!(dir = %dir.display(), "directory sync failed: {e}");
        }

        Ok(())
    }

    pub fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(key: &str) -> Checkpoint {
        Checkpoint::fresh(key, "docs_m", "docs_m__1", "m", EmbeddingTask::RetrievalPassage)
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "docs_m");
        assert!(manager.load().unwrap().is_none());

        let cp = manager.load_or(fresh("k")).unwrap();
        assert_eq!(cp.run_key, "k");
        assert_eq!(cp.processed_count(), 0);
        assert_eq!(cp.last_offset, 0);
    }

    #[test]
    fn test_commit_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "docs_m");
        let mut cp = fresh("k");

        manager
            .commit(&mut cp, ["a".to_string(), "b".to_string()], 2)
            .unwrap();
        manager.commit(&mut cp, ["c".to_string()], 3).unwrap();

        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded.processed_count(), 3);
        assert!(loaded.is_processed("b"));
        assert_eq!(loaded.last_offset, 3);
        assert_eq!(loaded.collection_name, "docs_m__1");
        assert!(!manager.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_or_resumes_matching_run() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "docs_m");
        let mut cp = fresh("k");
        manager.commit(&mut cp, ["a".to_string()], 1).unwrap();

        let resumed = manager.load_or(fresh("k")).unwrap();
        assert!(resumed.is_processed("a"));

        let err = manager.load_or(fresh("other")).unwrap_err();
        assert!(matches!(err, CheckpointError::Mismatch(_)));
    }

    #[test]
    fn test_persist_creates_directory_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let manager = CheckpointManager::new(&nested, "docs_m");
        let mut cp = fresh("k");

        manager.commit(&mut cp, ["a".to_string()], 1).unwrap();
        manager.commit(&mut cp, ["b".to_string()], 2).unwrap();

        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded.processed_count(), 2);
        assert_eq!(loaded.last_offset, 2);
        assert!(!manager.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "docs_m");
        fs::write(manager.path(), b"{not json").unwrap();
        assert!(matches!(manager.load(), Err(CheckpointError::Corrupt(_))));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "docs_m");
        manager.persist(&fresh("k")).unwrap();
        manager.clear().unwrap();
        manager.clear().unwrap();
        assert!(manager.load().unwrap().is_none());
    }

    #[test]
    fn test_run_key_depends_on_model_and_task() {
        let input = Path::new("corpus.jsonl");
        let a = Checkpoint::run_key(input, "m", EmbeddingTask::RetrievalPassage, None);
        let b = Checkpoint::run_key(input, "m", EmbeddingTask::RetrievalQuery, None);
        let c = Checkpoint::run_key(input, "m", EmbeddingTask::RetrievalPassage, Some(64));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Checkpoint::run_key(input, "m", EmbeddingTask::RetrievalPassage, None));
        assert_eq!(a.len(), 32);
    }
}
