//! End-to-end embedding runs against a SQLite store with a deterministic
//! in-process embedder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use chunkvec::error::{EmbeddingError, LoaderError, PipelineError};
use chunkvec::models::{Config, DuplicatePolicy};
use chunkvec::services::checkpoint::CheckpointManager;
use chunkvec::services::embedding::{EmbedOptions, Embedder, Embeddings, SharedEmbedder};
use chunkvec::services::monitor::ResourceSnapshot;
use chunkvec::services::pipeline::{EmbeddingPipeline, RunError, RunOptions, RunSummary};
use chunkvec::services::vector_store::{SqliteBackend, VectorStore};

const DIM: usize = 8;
const MODEL: &str = "test/hash-model";

/// Embeds each text as the normalized leading bytes of its SHA-256 digest.
/// Texts containing `REJECT` make the whole call fail as invalid input.
#[derive(Default)]
struct HashEmbedder {
    calls: AtomicUsize,
    texts: AtomicUsize,
    largest_batch: AtomicUsize,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl HashEmbedder {
    fn cancelling_after(calls: usize, token: CancellationToken) -> Self {
        Self {
            cancel_after: Some((calls, token)),
            ..Default::default()
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut v: Vec<f32> = digest
            .chunks(4)
            .take(DIM)
            .map(|c| {
                let n = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                (n as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        _options: &EmbedOptions,
    ) -> Result<Embeddings, EmbeddingError> {
        if texts.iter().any(|t| t.contains("REJECT")) {
            return Err(EmbeddingError::InvalidInput("unsupported content".into()));
        }

        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.largest_batch.fetch_max(texts.len(), Ordering::SeqCst);
        if let Some((limit, ref token)) = self.cancel_after
            && calls >= limit
        {
            token.cancel();
        }

        Ok(Embeddings {
            vectors: texts.iter().map(|t| Self::vector(t)).collect(),
            token_count: Some(texts.iter().map(|t| t.len() as u64 / 4).sum()),
        })
    }

    fn model_name(&self) -> &str {
        MODEL
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Temp directory with a corpus, a SQLite store and config paths inside it.
struct TestHarness {
    dir: TempDir,
    store: Arc<dyn VectorStore>,
    config: Config,
}

impl TestHarness {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store: Arc<dyn VectorStore> = Arc::new(
            SqliteBackend::open(&dir.path().join("store.db")).expect("Failed to open store"),
        );

        let mut config = Config::default();
        config.embedding.model = MODEL.to_string();
        config.embedding.dimension = DIM;
        config.checkpoint.dir = dir.path().join("checkpoints");
        config.output.manifest_path = dir.path().join("collections.txt");
        config.batching.retry_initial_delay_ms = 1;
        config.batching.retry_max_delay_ms = 2;

        Self { dir, store, config }
    }

    fn fixed_batch_size(&mut self, size: usize) {
        self.config.batching.batch_size = size;
        self.config.batching.min_batch_size = size;
        self.config.batching.max_batch_size = size;
    }

    fn write_corpus(&self, lines: &[String]) -> PathBuf {
        let path = self.dir.path().join("corpus.jsonl");
        std::fs::write(&path, lines.join("\n") + "\n").expect("Failed to write corpus");
        path
    }

    fn checkpoint_manager(&self, name: &str) -> CheckpointManager {
        CheckpointManager::new(&self.config.checkpoint.dir, name)
    }

    async fn run(
        &self,
        embedder: SharedEmbedder,
        input: &Path,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let (_tx, rx) = watch::channel(ResourceSnapshot::default());
        let pipeline =
            EmbeddingPipeline::new(self.config.clone(), embedder, Arc::clone(&self.store), rx);
        pipeline.run(&RunOptions::new(input, name), cancel).await
    }
}

fn record(id: &str, text: &str) -> String {
    serde_json::json!({ "id": id, "text": text, "source": format!("{id}.txt") }).to_string()
}

fn corpus(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| record(&format!("doc_{i:04}"), &format!("document number {i} about topic {}", i % 7)))
        .collect()
}

fn assert_counts_balance(summary: &RunSummary) {
    assert_eq!(
        summary.processed + summary.skipped.total() + summary.failed,
        summary.total_records,
        "every record is processed, skipped or failed exactly once: {summary:?}"
    );
}

#[tokio::test]
async fn embeds_corpus_and_finalizes_collection() {
    let harness = TestHarness::new();
    let mut lines = corpus(20);
    lines.insert(5, "not json at all".to_string());
    lines.insert(9, String::new());
    lines.push(record("doc_0003", "a second record reusing an id"));
    let input = harness.write_corpus(&lines);

    let embedder = Arc::new(HashEmbedder::default());
    let summary = harness
        .run(embedder.clone(), &input, "docs", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.total_records, 22);
    assert_eq!(summary.processed, 20);
    assert_eq!(summary.skipped.malformed, 1);
    assert_eq!(summary.skipped.duplicate, 1);
    assert_eq!(summary.failed, 0);
    assert_counts_balance(&summary);
    assert_eq!(summary.documents_in_collection, 20);
    assert_eq!(summary.malformed_records.len(), 1);
    assert!(!summary.resumed);
    assert_eq!(embedder.texts.load(Ordering::SeqCst), 20);

    let store = harness.store.as_ref();
    assert_eq!(
        store.resolve_alias("docs").await.unwrap().as_deref(),
        Some(summary.collection.as_str())
    );
    let manifest = store.get_manifest(&summary.collection).await.unwrap().unwrap();
    assert!(manifest.is_complete());
    assert_eq!(manifest.document_count, 20);
    assert_eq!(manifest.dimensionality, DIM);
    assert_eq!(manifest.model_name, MODEL);

    let fetched = store
        .fetch(&summary.collection, &["doc_0007".to_string()])
        .await
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].source, "doc_0007.txt");
    assert_eq!(fetched[0].vector.len(), DIM);

    assert!(harness.checkpoint_manager("docs").load().unwrap().is_none());
    let run_manifest = std::fs::read_to_string(&harness.config.output.manifest_path).unwrap();
    assert_eq!(run_manifest.lines().count(), 1);
    assert!(run_manifest.contains(&format!("Collection: {}", summary.collection)));
}

#[tokio::test]
async fn resumes_from_checkpoint_without_reembedding() {
    let mut harness = TestHarness::new();
    harness.fixed_batch_size(50);
    let input = harness.write_corpus(&corpus(1000));

    let cancel = CancellationToken::new();
    let first = Arc::new(HashEmbedder::cancelling_after(8, cancel.clone()));
    let err = harness.run(first.clone(), &input, "big", cancel).await.unwrap_err();
    assert!(matches!(err.error, PipelineError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(first.texts.load(Ordering::SeqCst), 400);
    assert_eq!(err.counts.processed, 400);
    assert_eq!(err.counts.checkpointed, 400);
    assert_eq!(err.counts.failed, 0);

    let checkpoint = harness.checkpoint_manager("big").load().unwrap().unwrap();
    assert_eq!(checkpoint.processed_count(), 400);
    assert!(harness.store.resolve_alias("big").await.unwrap().is_none());
    let partial = harness
        .store
        .collection_info(&checkpoint.collection_name)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial.points_count, 400);

    let second = Arc::new(HashEmbedder::default());
    let summary = harness
        .run(second.clone(), &input, "big", CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.resumed);
    assert_eq!(summary.collection, checkpoint.collection_name);
    assert_eq!(second.texts.load(Ordering::SeqCst), 600);
    assert_eq!(summary.processed, 600);
    assert_eq!(summary.skipped.already_processed, 400);
    assert_counts_balance(&summary);
    assert_eq!(summary.documents_in_collection, 1000);
    assert!(harness.checkpoint_manager("big").load().unwrap().is_none());
}

#[tokio::test]
async fn restart_discards_unfinished_collection() {
    let mut harness = TestHarness::new();
    harness.fixed_batch_size(10);
    let input = harness.write_corpus(&corpus(50));

    let cancel = CancellationToken::new();
    let embedder = Arc::new(HashEmbedder::cancelling_after(2, cancel.clone()));
    harness.run(embedder, &input, "docs", cancel).await.unwrap_err();
    let abandoned = harness.checkpoint_manager("docs").load().unwrap().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let (_tx, rx) = watch::channel(ResourceSnapshot::default());
    let pipeline = EmbeddingPipeline::new(
        harness.config.clone(),
        Arc::new(HashEmbedder::default()),
        Arc::clone(&harness.store),
        rx,
    );
    let mut options = RunOptions::new(&input, "docs");
    options.restart = true;
    let summary = pipeline.run(&options, CancellationToken::new()).await.unwrap();

    assert!(!summary.resumed);
    assert_eq!(summary.processed, 50);
    assert_ne!(summary.collection, abandoned.collection_name);
    assert!(
        harness
            .store
            .collection_info(&abandoned.collection_name)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn rejected_batches_are_reported_as_failed() {
    let mut harness = TestHarness::new();
    harness.fixed_batch_size(1);
    let mut lines = corpus(6);
    lines.insert(2, record("bad", "REJECT this record"));
    let input = harness.write_corpus(&lines);

    let summary = harness
        .run(Arc::new(HashEmbedder::default()), &input, "docs", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.processed, 6);
    assert_eq!(summary.failed, 1);
    assert_counts_balance(&summary);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].ids, vec!["bad".to_string()]);
    assert_eq!(summary.documents_in_collection, 6);
}

#[tokio::test]
async fn offset_resume_rereads_rejected_documents() {
    let mut harness = TestHarness::new();
    harness.fixed_batch_size(1);
    harness.config.input.resume_from_offset = true;
    let mut lines = corpus(5);
    lines.insert(1, record("bad", "REJECT this record"));
    let input = harness.write_corpus(&lines);

    let cancel = CancellationToken::new();
    let first = Arc::new(HashEmbedder::cancelling_after(2, cancel.clone()));
    let err = harness.run(first, &input, "docs", cancel).await.unwrap_err();
    assert!(matches!(err.error, PipelineError::Cancelled));
    assert_eq!(err.counts.processed, 2);
    assert_eq!(err.counts.failed, 1);

    let checkpoint = harness.checkpoint_manager("docs").load().unwrap().unwrap();
    assert_eq!(checkpoint.processed_count(), 2);
    assert!(checkpoint.is_processed("doc_0001"));
    assert_eq!(checkpoint.last_offset, 1);

    let summary = harness
        .run(Arc::new(HashEmbedder::default()), &input, "docs", CancellationToken::new())
        .await
        .unwrap();
    assert!(summary.resumed);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].ids, vec!["bad".to_string()]);
    assert_eq!(summary.skipped.already_processed, 1);
    assert_eq!(summary.processed, 3);
    assert_counts_balance(&summary);
    assert_eq!(summary.documents_in_collection, 5);
}

#[tokio::test]
async fn duplicate_ids_follow_policy() {
    let mut harness = TestHarness::new();
    let lines = vec![
        record("a", "first text for a"),
        record("b", "first text for b"),
        record("a", "second text for a"),
    ];
    let input = harness.write_corpus(&lines);

    let summary = harness
        .run(Arc::new(HashEmbedder::default()), &input, "skip", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.skipped.duplicate, 1);
    assert_counts_balance(&summary);
    let kept = harness
        .store
        .fetch(&summary.collection, &["a".to_string()])
        .await
        .unwrap();
    assert_eq!(kept[0].text, "first text for a");

    harness.config.input.duplicate_policy = DuplicatePolicy::Reject;
    let err = harness
        .run(Arc::new(HashEmbedder::default()), &input, "reject", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.error,
        PipelineError::Loader(LoaderError::DuplicateId { ref id, line: 3 }) if id == "a"
    ));
    assert!(harness.store.resolve_alias("reject").await.unwrap().is_none());
}

#[tokio::test]
async fn batch_size_stays_within_bounds() {
    let mut harness = TestHarness::new();
    harness.config.batching.batch_size = 4;
    harness.config.batching.min_batch_size = 2;
    harness.config.batching.max_batch_size = 16;
    harness.config.batching.increase_step = 4;
    harness.config.batching.stable_batches = 1;
    let input = harness.write_corpus(&corpus(300));

    let embedder = Arc::new(HashEmbedder::default());
    let summary = harness
        .run(embedder.clone(), &input, "docs", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.processed, 300);
    assert!((2..=16).contains(&summary.final_batch_size));
    assert!(embedder.largest_batch.load(Ordering::SeqCst) <= 16);
    assert_eq!(summary.batches, embedder.calls.load(Ordering::SeqCst) as u64);
}

#[tokio::test]
async fn rerun_replaces_previous_collection() {
    let harness = TestHarness::new();
    let input = harness.write_corpus(&corpus(30));

    let first = harness
        .run(Arc::new(HashEmbedder::default()), &input, "docs", CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = harness
        .run(Arc::new(HashEmbedder::default()), &input, "docs", CancellationToken::new())
        .await
        .unwrap();

    assert_ne!(first.collection, second.collection);
    assert_eq!(second.replaced_collection.as_deref(), Some(first.collection.as_str()));
    assert_eq!(
        harness.store.resolve_alias("docs").await.unwrap().as_deref(),
        Some(second.collection.as_str())
    );
    assert!(
        harness
            .store
            .collection_info(&first.collection)
            .await
            .unwrap()
            .is_none()
    );

    let run_manifest = std::fs::read_to_string(&harness.config.output.manifest_path).unwrap();
    assert_eq!(run_manifest.lines().count(), 2);
}

#[tokio::test]
async fn upserting_the_same_batch_twice_keeps_one_copy() {
    let harness = TestHarness::new();
    let input = harness.write_corpus(&corpus(10));
    let summary = harness
        .run(Arc::new(HashEmbedder::default()), &input, "docs", CancellationToken::new())
        .await
        .unwrap();

    let ids = harness.store.list_ids(&summary.collection).await.unwrap();
    let records = harness.store.fetch(&summary.collection, &ids).await.unwrap();
    harness
        .store
        .upsert(&summary.collection, records.clone())
        .await
        .unwrap();
    harness.store.upsert(&summary.collection, records).await.unwrap();

    let info = harness
        .store
        .collection_info(&summary.collection)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.points_count, 10);
}

#[tokio::test]
async fn truncate_dim_beyond_model_dimension_is_rejected() {
    let mut harness = TestHarness::new();
    harness.config.embedding.truncate_dim = Some(DIM * 2);
    harness.config.embedding.dimension = DIM * 2;
    let input = harness.write_corpus(&corpus(3));

    let err = harness
        .run(Arc::new(HashEmbedder::default()), &input, "docs", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err.error, PipelineError::Configuration(_)));
    assert_eq!(err.counts.total_records, 0);
    assert!(harness.store.list_collections().await.unwrap().is_empty());
}
