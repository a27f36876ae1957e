//! One embedding run, from corpus file to finalized collection.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Local, Utc};
use indicatif::ProgressBar;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::batcher::{BatchOrchestrator, BatchOutcome, OrchestratorStats};
use super::checkpoint::{Checkpoint, CheckpointManager};
use super::embedding::{EmbedOptions, SharedEmbedder};
use super::loader::{LoaderOptions, LoaderStats, RecordLoader};
use super::monitor::ResourceSnapshot;
use super::vector_store::VectorStore;
use super::writer::{FinalizeReport, VectorStoreWriter};
use crate::error::{ConfigError, MalformedRecordError, PipelineError};
use crate::models::{CollectionManifest, Config, Document, EmbeddingTask, physical_collection_name};

/// Upper bound on rejected batches kept in the summary.
const MAX_REPORTED_FAILURES: usize = 50;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: PathBuf,
    /// Logical collection name.
    pub name: String,
    /// Discard any existing checkpoint and start over.
    pub restart: bool,
    pub progress: ProgressBar,
}

impl RunOptions {
    pub fn new(input: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            name: name.into(),
            restart: false,
            progress: ProgressBar::hidden(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SkipCounts {
    pub malformed: u64,
    pub duplicate: u64,
    pub already_processed: u64,
}

impl SkipCounts {
    pub fn total(&self) -> u64 {
        self.malformed + self.duplicate + self.already_processed
    }
}

/// A batch the model rejected as invalid input.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub ids: Vec<String>,
    pub reason: String,
}

/// Counts accumulated up to the point a run stopped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounts {
    pub total_records: u64,
    /// Documents embedded and committed by this invocation.
    pub processed: u64,
    pub skipped: SkipCounts,
    pub failed: u64,
    /// Documents committed to the checkpoint across all invocations.
    pub checkpointed: u64,
}

/// A run that stopped before finalizing, with the progress it made.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunError {
    pub error: PipelineError,
    pub counts: RunCounts,
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub name: String,
    pub collection: String,
    pub model: String,
    pub task: EmbeddingTask,
    pub store_location: String,
    pub resumed: bool,
    pub total_records: u64,
    pub processed: u64,
    pub skipped: SkipCounts,
    pub failed: u64,
    pub truncated: u64,
    pub tokens: u64,
    pub elapsed_secs: f64,
    pub docs_per_sec: f64,
    pub tokens_per_sec: f64,
    pub final_batch_size: usize,
    pub batches: u64,
    pub retries: u64,
    pub documents_in_collection: u64,
    pub replaced_collection: Option<String>,
    pub resources: ResourceSnapshot,
    pub malformed_records: Vec<MalformedRecordError>,
    pub failures: Vec<BatchFailure>,
}

pub struct EmbeddingPipeline {
    config: Config,
    embedder: SharedEmbedder,
    writer: VectorStoreWriter,
    resources: watch::Receiver<ResourceSnapshot>,
}

/// Mutable state of a run in progress.
struct RunState {
    checkpoint: Checkpoint,
    processed: u64,
    failed: u64,
    failures: Vec<BatchFailure>,
    /// Highest offset a resumed run may skip to: the line before the
    /// earliest rejected document, which must be read again.
    offset_ceiling: Option<u64>,
}

impl RunState {
    fn committed_offset(&self, last_line: u64) -> u64 {
        self.offset_ceiling
            .map_or(last_line, |ceiling| last_line.min(ceiling))
    }

    fn counts(&self, stats: &LoaderStats) -> RunCounts {
        RunCounts {
            total_records: stats.total_records,
            processed: self.processed,
            skipped: SkipCounts {
                malformed: stats.malformed,
                duplicate: stats.duplicates,
                already_processed: stats.already_processed,
            },
            failed: self.failed,
            checkpointed: self.checkpoint.processed_count() as u64,
        }
    }
}

impl EmbeddingPipeline {
    pub fn new(
        config: Config,
        embedder: SharedEmbedder,
        store: Arc<dyn VectorStore>,
        resources: watch::Receiver<ResourceSnapshot>,
    ) -> Self {
        let writer = VectorStoreWriter::new(store, config.vector_store.write_retries);
        Self {
            config,
            embedder,
            writer,
            resources,
        }
    }

    /// Embed `options.input` into a new collection and finalize it.
    ///
    /// On failure the returned error carries the counts reached so far; the
    /// checkpoint stays on disk for a later resume.
    pub async fn run(
        &self,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let mut counts = RunCounts::default();
        let result = self.execute(options, cancel, &mut counts).await;
        result.map_err(|error| RunError { error, counts })
    }

    async fn execute(
        &self,
        options: &RunOptions,
        cancel: CancellationToken,
        counts: &mut RunCounts,
    ) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let embedding = &self.config.embedding;
        let dimension = embedding.output_dimension();

        if dimension > self.embedder.dimension() {
            return Err(ConfigError::ValidationError(format!(
                "requested dimension {} exceeds model dimension {}",
                dimension,
                self.embedder.dimension()
            ))
            .into());
        }

        let manager = self
            .config
            .checkpoint
            .enabled
            .then(|| CheckpointManager::new(&self.config.checkpoint.dir, &options.name));

        if options.restart {
            self.discard_checkpoint(manager.as_ref(), &options.name).await?;
        }

        let run_key = Checkpoint::run_key(
            &options.input,
            &embedding.model,
            embedding.task,
            embedding.truncate_dim,
        );
        let fresh = Checkpoint::fresh(
            run_key,
            &options.name,
            physical_collection_name(&options.name, Utc::now()),
            &embedding.model,
            embedding.task,
        );
        let checkpoint = match manager {
            Some(ref m) => m.load_or(fresh)?,
            None => fresh,
        };
        let resumed = checkpoint.processed_count() > 0;
        let collection = checkpoint.collection_name.clone();

        let mut manifest = match self.writer.store().get_manifest(&collection).await? {
            Some(existing) => existing,
            None => CollectionManifest::new(
                &options.name,
                &collection,
                &embedding.model,
                embedding.task,
                dimension,
            ),
        };
        manifest.dimensionality = dimension;
        self.writer.ensure_collection(&manifest).await?;

        let loader_options = LoaderOptions {
            malformed_policy: self.config.input.malformed_policy,
            duplicate_policy: self.config.input.duplicate_policy,
            start_offset: if self.config.input.resume_from_offset {
                checkpoint.last_offset
            } else {
                0
            },
        };
        let mut loader = RecordLoader::open(&options.input, loader_options)?
            .with_processed_ids(checkpoint.processed_ids.iter().cloned());

        let mut orchestrator = BatchOrchestrator::new(
            Arc::clone(&self.embedder),
            EmbedOptions::from_config(embedding),
            &self.config.batching,
            self.resources.clone(),
            dimension,
        );

        let progress = &options.progress;
        progress.set_length(count_records(&options.input).unwrap_or(0));
        progress.set_position(0);

        info!(
            input = %options.input.display(),
            collection = %collection,
            resumed,
            "starting embedding run"
        );

        let mut state = RunState {
            checkpoint,
            processed: 0,
            failed: 0,
            failures: Vec::new(),
            offset_ceiling: None,
        };

        let outcome = self
            .drive(
                &mut loader,
                &mut orchestrator,
                &mut state,
                manager.as_ref(),
                progress,
                &cancel,
            )
            .await;

        *counts = state.counts(loader.stats());

        if let Err(e) = outcome {
            if let Some(ref m) = manager
                && let Err(flush) = m.persist(&state.checkpoint)
            {
                warn!("final checkpoint flush failed: {flush}");
            }
            progress.abandon_with_message(format!("stopped: {e}"));
            return Err(e);
        }

        let report = self
            .writer
            .finalize(&mut manifest, state.checkpoint.processed_count() as u64)
            .await?;

        if let Err(e) = append_run_manifest(&self.config.output.manifest_path, &manifest) {
            warn!(
                path = %self.config.output.manifest_path.display(),
                "failed to append run manifest: {e}"
            );
        }
        if let Some(ref m) = manager {
            m.clear()?;
        }
        progress.finish_and_clear();

        let stats = loader.into_stats();
        Ok(self.summarize(
            options,
            report,
            stats,
            orchestrator.stats(),
            orchestrator.batch_size(),
            orchestrator.snapshot(),
            state,
            resumed,
            started,
        ))
    }

    async fn drive<R: BufRead>(
        &self,
        loader: &mut RecordLoader<R>,
        orchestrator: &mut BatchOrchestrator,
        state: &mut RunState,
        manager: Option<&CheckpointManager>,
        progress: &ProgressBar,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let collection = state.checkpoint.collection_name.clone();
        let mut pending: VecDeque<Document> = VecDeque::new();
        let mut exhausted = false;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            while !exhausted && pending.len() < orchestrator.batch_size() {
                match loader.next() {
                    Some(Ok(doc)) => pending.push_back(doc),
                    Some(Err(e)) => return Err(e.into()),
                    None => exhausted = true,
                }
            }
            if pending.is_empty() {
                return Ok(());
            }

            match orchestrator.process_next(&mut pending, cancel).await? {
                BatchOutcome::Embedded {
                    records,
                    last_line,
                    tokens,
                    latency,
                } => {
                    self.writer.write_batch(&collection, &records).await?;
                    let ids: Vec<String> = records.into_iter().map(|r| r.id).collect();
                    let count = ids.len() as u64;
                    let offset = state.committed_offset(last_line);
                    match manager {
                        Some(m) => m.commit(&mut state.checkpoint, ids, offset)?,
                        None => {
                            state.checkpoint.processed_ids.extend(ids);
                            state.checkpoint.last_offset = state.checkpoint.last_offset.max(offset);
                        }
                    }
                    state.processed += count;
                    debug!(count, tokens, ?latency, last_line, "batch committed");
                }
                BatchOutcome::Rejected { documents, reason } => {
                    state.failed += documents.len() as u64;
                    if let Some(first) = documents.iter().map(|d| d.line).min() {
                        let ceiling = first.saturating_sub(1);
                        state.offset_ceiling =
                            Some(state.offset_ceiling.map_or(ceiling, |c| c.min(ceiling)));
                    }
                    if state.failures.len() < MAX_REPORTED_FAILURES {
                        state.failures.push(BatchFailure {
                            ids: documents.into_iter().map(|d| d.id).collect(),
                            reason,
                        });
                    }
                }
            }

            let stats = loader.stats();
            progress.set_position(stats.total_records.saturating_sub(pending.len() as u64));
            progress.set_message(format!(
                "batch {} | {}",
                orchestrator.batch_size(),
                orchestrator.snapshot().short_summary()
            ));
        }
    }

    async fn discard_checkpoint(
        &self,
        manager: Option<&CheckpointManager>,
        name: &str,
    ) -> Result<(), PipelineError> {
        let Some(manager) = manager else {
            return Ok(());
        };
        if let Some(old) = manager.load().ok().flatten() {
            let live = self.writer.store().resolve_alias(name).await?;
            if live.as_deref() != Some(old.collection_name.as_str()) {
                info!(collection = %old.collection_name, "discarding unfinished collection");
                self.writer.discard(&old.collection_name).await?;
            }
        }
        manager.clear()?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        options: &RunOptions,
        report: FinalizeReport,
        stats: LoaderStats,
        orchestrator: &OrchestratorStats,
        final_batch_size: usize,
        resources: ResourceSnapshot,
        state: RunState,
        resumed: bool,
        started: Instant,
    ) -> RunSummary {
        let elapsed = started.elapsed().as_secs_f64();
        let rate = |n: u64| if elapsed > 0.0 { n as f64 / elapsed } else { 0.0 };

        RunSummary {
            name: options.name.clone(),
            collection: report.collection,
            model: self.embedder.model_name().to_string(),
            task: self.config.embedding.task,
            store_location: self.writer.store().location(),
            resumed,
            total_records: stats.total_records,
            processed: state.processed,
            skipped: SkipCounts {
                malformed: stats.malformed,
                duplicate: stats.duplicates,
                already_processed: stats.already_processed,
            },
            failed: state.failed,
            truncated: orchestrator.truncated,
            tokens: orchestrator.tokens,
            elapsed_secs: elapsed,
            docs_per_sec: rate(state.processed),
            tokens_per_sec: rate(orchestrator.tokens),
            final_batch_size,
            batches: orchestrator.batches,
            retries: orchestrator.retries,
            documents_in_collection: report.document_count,
            replaced_collection: report.replaced,
            resources,
            malformed_records: stats.errors,
            failures: state.failures,
        }
    }
}

/// Count non-blank lines for progress reporting.
fn count_records(path: &Path) -> std::io::Result<u64> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut count = 0;
    for line in reader.split(b'\n') {
        if line?.iter().any(|b| !b.is_ascii_whitespace()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Append one line describing a finalized collection.
pub fn append_run_manifest(path: &Path, manifest: &CollectionManifest) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "{} ({}) - Model: {}, Task: {}, Collection: {}",
        manifest.name,
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        manifest.model_name,
        manifest.task,
        manifest.collection
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_records_ignores_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.jsonl");
        std::fs::write(&path, "{}\n\n   \n{}\n{}").unwrap();
        assert_eq!(count_records(&path).unwrap(), 3);
    }

    #[test]
    fn test_append_run_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("collections.txt");
        let manifest = CollectionManifest::new(
            "docs_m",
            "docs_m__20260101000000",
            "org/m",
            EmbeddingTask::RetrievalPassage,
            8,
        );
        append_run_manifest(&path, &manifest).unwrap();
        append_run_manifest(&path, &manifest).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("docs_m ("));
        assert!(lines[0].ends_with(
            "- Model: org/m, Task: retrieval.passage, Collection: docs_m__20260101000000"
        ));
    }

    #[test]
    fn test_skip_counts_total() {
        let skipped = SkipCounts {
            malformed: 1,
            duplicate: 2,
            already_processed: 3,
        };
        assert_eq!(skipped.total(), 6);
    }
}
