//! Adaptive batch sizing and batch execution.
//!
//! [`AdaptiveBatchSizer`] adjusts the batch size additively up and
//! multiplicatively down from latency and memory observations.
//! [`BatchOrchestrator`] takes documents off the front of the pending queue,
//! embeds them and drives the bounded retry state machine.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::embedding::{EmbedOptions, SharedEmbedder};
use super::monitor::ResourceSnapshot;
use crate::error::{EmbeddingError, PipelineError};
use crate::models::{BatchingConfig, Document, EmbeddingRecord};
use crate::utils::{RetryConfig, Retryable, char_budget, estimate_tokens, truncate_chars};

/// Bounds and thresholds for batch sizing.
#[derive(Debug, Clone)]
pub struct BatchSizing {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    pub increase_step: usize,
    pub stable_batches: u32,
    pub latency_high_water: Duration,
    pub memory_threshold_percent: f32,
    pub comfort_ratio: f32,
}

impl From<&BatchingConfig> for BatchSizing {
    fn from(config: &BatchingConfig) -> Self {
        Self {
            initial: config.batch_size,
            min: config.min_batch_size,
            max: config.max_batch_size,
            increase_step: config.increase_step.max(1),
            stable_batches: config.stable_batches.max(1),
            latency_high_water: Duration::from_millis(config.latency_high_water_ms),
            memory_threshold_percent: config.memory_threshold_percent,
            comfort_ratio: config.comfort_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizeAdjustment {
    Unchanged,
    Decreased { from: usize, to: usize },
    Increased { from: usize, to: usize },
}

#[derive(Debug, Clone)]
pub struct AdaptiveBatchSizer {
    sizing: BatchSizing,
    current: usize,
    comfortable_streak: u32,
}

impl AdaptiveBatchSizer {
    pub fn new(sizing: BatchSizing) -> Self {
        let current = sizing.initial.clamp(sizing.min, sizing.max);
        Self {
            sizing,
            current,
            comfortable_streak: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.sizing.min, self.sizing.max)
    }

    /// Feed the outcome of one successful batch.
    pub fn observe(&mut self, latency: Duration, snapshot: &ResourceSnapshot) -> SizeAdjustment {
        if self.under_pressure(latency, snapshot) {
            return self.halve();
        }

        if !self.comfortable(latency, snapshot) {
            self.comfortable_streak = 0;
            return SizeAdjustment::Unchanged;
        }

        self.comfortable_streak += 1;
        if self.comfortable_streak < self.sizing.stable_batches {
            return SizeAdjustment::Unchanged;
        }

        self.comfortable_streak = 0;
        let from = self.current;
        self.current = (self.current + self.sizing.increase_step).min(self.sizing.max);
        if self.current == from {
            SizeAdjustment::Unchanged
        } else {
            SizeAdjustment::Increased {
                from,
                to: self.current,
            }
        }
    }

    /// A transient embedding failure always shrinks the batch.
    pub fn on_transient_failure(&mut self) -> SizeAdjustment {
        self.halve()
    }

    fn halve(&mut self) -> SizeAdjustment {
        self.comfortable_streak = 0;
        let from = self.current;
        self.current = (self.current / 2).max(self.sizing.min);
        if self.current == from {
            SizeAdjustment::Unchanged
        } else {
            SizeAdjustment::Decreased {
                from,
                to: self.current,
            }
        }
    }

    fn under_pressure(&self, latency: Duration, snapshot: &ResourceSnapshot) -> bool {
        latency > self.sizing.latency_high_water
            || snapshot.memory_pressure_percent() > self.sizing.memory_threshold_percent
    }

    /// Comfort needs a real sample: the unsampled default never grows a batch.
    fn comfortable(&self, latency: Duration, snapshot: &ResourceSnapshot) -> bool {
        let ratio = self.sizing.comfort_ratio;
        snapshot.is_sampled()
            && latency.as_secs_f64()
                < self.sizing.latency_high_water.as_secs_f64() * f64::from(ratio)
            && snapshot.memory_pressure_percent() < self.sizing.memory_threshold_percent * ratio
    }
}

/// Result of processing the documents at the front of the queue.
#[derive(Debug)]
pub enum BatchOutcome {
    Embedded {
        records: Vec<EmbeddingRecord>,
        /// Corpus line of the last document in the batch.
        last_line: u64,
        tokens: u64,
        latency: Duration,
    },
    /// The model rejected the batch as invalid input; its documents count as failed.
    Rejected {
        documents: Vec<Document>,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStats {
    pub batches: u64,
    pub retries: u64,
    pub size_increases: u64,
    pub size_decreases: u64,
    pub truncated: u64,
    pub tokens: u64,
}

/// Explicit retry states for one batch.
enum RetryState {
    Attempting { attempt: u32 },
    TransientFailure { attempt: u32, error: EmbeddingError },
    RetriesExhausted { attempts: u32, error: EmbeddingError },
}

pub struct BatchOrchestrator {
    embedder: SharedEmbedder,
    options: EmbedOptions,
    sizer: AdaptiveBatchSizer,
    retry: RetryConfig,
    resources: watch::Receiver<ResourceSnapshot>,
    expected_dimension: usize,
    max_chars: usize,
    stats: OrchestratorStats,
}

impl BatchOrchestrator {
    pub fn new(
        embedder: SharedEmbedder,
        options: EmbedOptions,
        config: &BatchingConfig,
        resources: watch::Receiver<ResourceSnapshot>,
        expected_dimension: usize,
    ) -> Self {
        let retry = RetryConfig::new(config.max_retries.saturating_add(1))
            .with_initial_delay(Duration::from_millis(config.retry_initial_delay_ms))
            .with_max_delay(Duration::from_millis(config.retry_max_delay_ms));

        Self {
            embedder,
            max_chars: char_budget(options.max_length),
            options,
            sizer: AdaptiveBatchSizer::new(BatchSizing::from(config)),
            retry,
            resources,
            expected_dimension,
            stats: OrchestratorStats::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.sizer.current()
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.resources.borrow().clone()
    }

    /// Embed the documents at the front of `pending`.
    ///
    /// On success the batch is removed from the queue. On a transient failure
    /// the documents go back to the front and a smaller leading slice is
    /// retried. On any error the unprocessed documents stay queued.
    pub async fn process_next(
        &mut self,
        pending: &mut VecDeque<Document>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, PipelineError> {
        let mut backoff = self.retry.backoff();
        let mut state = RetryState::Attempting { attempt: 1 };

        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }

                    let size = self.sizer.current().min(pending.len());
                    let mut batch: Vec<Document> = pending.drain(..size).collect();
                    for doc in &mut batch {
                        if truncate_chars(&mut doc.text, self.max_chars) {
                            debug!(id = %doc.id, max_chars = self.max_chars, "truncated document");
                            self.stats.truncated += 1;
                        }
                    }
                    let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();

                    let started = Instant::now();
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            requeue(pending, batch);
                            return Err(PipelineError::Cancelled);
                        }
                        r = self.embedder.embed(&texts, &self.options) => r,
                    };
                    let latency = started.elapsed();

                    match result {
                        Ok(embeddings) => {
                            return self.accept(batch, embeddings, latency);
                        }
                        Err(EmbeddingError::InvalidInput(reason)) => {
                            warn!(documents = batch.len(), %reason, "batch rejected by model");
                            self.stats.batches += 1;
                            return Ok(BatchOutcome::Rejected {
                                documents: batch,
                                reason,
                            });
                        }
                        Err(error) if error.is_retryable() => {
                            requeue(pending, batch);
                            RetryState::TransientFailure { attempt, error }
                        }
                        Err(error) => {
                            requeue(pending, batch);
                            return Err(PipelineError::Embedding(error));
                        }
                    }
                }
                RetryState::TransientFailure { attempt, error } => {
                    if let SizeAdjustment::Decreased { from, to } = self.sizer.on_transient_failure() {
                        self.stats.size_decreases += 1;
                        info!(from, to, "batch size reduced after transient failure");
                    }

                    if attempt >= self.retry.max_attempts {
                        RetryState::RetriesExhausted {
                            attempts: attempt,
                            error,
                        }
                    } else {
                        let delay = backoff.next_delay();
                        warn!(attempt, ?delay, %error, "transient embedding failure, retrying");
                        self.stats.retries += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        RetryState::Attempting {
                            attempt: attempt + 1,
                        }
                    }
                }
                RetryState::RetriesExhausted { attempts, error } => {
                    return Err(PipelineError::TransientResource {
                        attempts,
                        message: error.to_string(),
                    });
                }
            };
        }
    }

    fn accept(
        &mut self,
        batch: Vec<Document>,
        embeddings: super::embedding::Embeddings,
        latency: Duration,
    ) -> Result<BatchOutcome, PipelineError> {
        if embeddings.vectors.len() != batch.len() {
            return Err(PipelineError::Embedding(EmbeddingError::InvalidResponse(
                format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    embeddings.vectors.len()
                ),
            )));
        }
        if let Some((doc, v)) = batch
            .iter()
            .zip(&embeddings.vectors)
            .find(|(_, v)| v.len() != self.expected_dimension)
        {
            return Err(PipelineError::StorageIntegrity(format!(
                "embedding for '{}' has dimension {}, expected {}",
                doc.id,
                v.len(),
                self.expected_dimension
            )));
        }

        let tokens = embeddings.token_count.unwrap_or_else(|| {
            batch
                .iter()
                .map(|d| estimate_tokens(&d.text) as u64)
                .sum()
        });
        self.stats.tokens += tokens;
        self.stats.batches += 1;

        let snapshot = self.snapshot();
        match self.sizer.observe(latency, &snapshot) {
            SizeAdjustment::Decreased { from, to } => {
                self.stats.size_decreases += 1;
                info!(from, to, ?latency, memory = snapshot.memory_pressure_percent(), "batch size reduced");
            }
            SizeAdjustment::Increased { from, to } => {
                self.stats.size_increases += 1;
                debug!(from, to, "batch size increased");
            }
            SizeAdjustment::Unchanged => {}
        }

        let last_line = batch.last().map_or(0, |d| d.line);
        let records = batch
            .into_iter()
            .zip(embeddings.vectors)
            .map(|(doc, vector)| EmbeddingRecord::from_document(doc, vector))
            .collect();

        Ok(BatchOutcome::Embedded {
            records,
            last_line,
            tokens,
            latency,
        })
    }
}

fn requeue(pending: &mut VecDeque<Document>, batch: Vec<Document>) {
    for doc in batch.into_iter().rev() {
        pending.push_front(doc);
    }
}
