//! Embed command implementation.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::CommandContext;
use super::analyze::run_analysis;
use crate::analysis::AnalysisParams;
use crate::models::{
    Config, Device, DuplicatePolicy, EmbeddingBackend, EmbeddingTask, MalformedPolicy,
    OutputFormat, VectorDriver, derive_collection_name,
};
use crate::services::embedding::create_embedder;
use crate::services::monitor::ResourceMonitor;
use crate::services::pipeline::{EmbeddingPipeline, RunOptions};

#[derive(Debug, Args)]
pub struct EmbedArgs {
    /// JSONL corpus (defaults to `input.path` from the config)
    pub input: Option<PathBuf>,

    /// Logical collection name (default: <input stem>_<model short name>)
    #[arg(long, short = 'n')]
    pub name: Option<String>,

    /// Embedding model name
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Local model directory with model.onnx and tokenizer.json
    #[arg(long)]
    pub model_path: Option<PathBuf>,

    /// Embedding backend: onnx or http
    #[arg(long)]
    pub backend: Option<EmbeddingBackend>,

    /// Task passed to the model
    #[arg(long, short = 't')]
    pub task: Option<EmbeddingTask>,

    /// Keep only the leading dimensions of each vector
    #[arg(long)]
    pub truncate_dim: Option<usize>,

    /// Maximum tokens per document
    #[arg(long)]
    pub max_length: Option<usize>,

    /// Initial batch size
    #[arg(long, short = 'b')]
    pub batch_size: Option<usize>,

    /// Compute device: cuda, cpu or auto
    #[arg(long)]
    pub device: Option<Device>,

    /// Vector store driver: sqlite or qdrant
    #[arg(long)]
    pub driver: Option<VectorDriver>,

    /// SQLite database path
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Malformed records: skip or abort
    #[arg(long)]
    pub on_malformed: Option<MalformedPolicy>,

    /// Repeated ids: skip or reject
    #[arg(long)]
    pub on_duplicate: Option<DuplicatePolicy>,

    /// Discard any checkpoint for this collection and start over
    #[arg(long)]
    pub restart: bool,

    /// Do not write checkpoints
    #[arg(long)]
    pub no_checkpoint: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Analyze the collection once it is finalized
    #[arg(long)]
    pub analyze: bool,
}

impl EmbedArgs {
    /// Command-line flags take precedence over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(ref input) = self.input {
            config.input.path = Some(input.clone());
        }
        if let Some(ref name) = self.name {
            config.vector_store.collection = Some(name.clone());
        }
        if let Some(ref model) = self.model {
            config.embedding.model = model.clone();
        }
        if let Some(ref path) = self.model_path {
            config.embedding.model_path = Some(path.clone());
        }
        if let Some(backend) = self.backend {
            config.embedding.backend = backend;
        }
        if let Some(task) = self.task {
            config.embedding.task = task;
        }
        if let Some(dim) = self.truncate_dim {
            config.embedding.truncate_dim = Some(dim);
        }
        if let Some(len) = self.max_length {
            config.embedding.max_length = len;
        }
        if let Some(size) = self.batch_size {
            let b = &mut config.batching;
            b.batch_size = size;
            b.max_batch_size = b.max_batch_size.max(size);
            b.min_batch_size = b.min_batch_size.min(size.max(1));
        }
        if let Some(device) = self.device {
            config.embedding.device = device;
        }
        if let Some(driver) = self.driver {
            config.vector_store.driver = driver;
        }
        if let Some(ref path) = self.db_path {
            config.vector_store.db_path = path.clone();
        }
        if let Some(policy) = self.on_malformed {
            config.input.malformed_policy = policy;
        }
        if let Some(policy) = self.on_duplicate {
            config.input.duplicate_policy = policy;
        }
        if self.no_checkpoint {
            config.checkpoint.enabled = false;
        }
    }
}

pub async fn handle_embed(args: EmbedArgs, ctx: &CommandContext) -> Result<()> {
    let formatter = ctx.formatter();
    let mut config = ctx.config.clone();
    args.apply(&mut config);
    let input = config.validate_for_run()?;

    let name = config
        .vector_store
        .collection
        .clone()
        .unwrap_or_else(|| derive_collection_name(&input, config.embedding.model_short_name()));

    let embedder = create_embedder(&config.embedding)
        .with_context(|| format!("failed to initialize embedding model {}", config.embedding.model))?;
    embedder
        .health_check()
        .await
        .context("embedding backend is not available")?;
    let store = super::open_store(&config).await?;

    let monitor = ResourceMonitor::spawn(&config.monitor);
    let show_progress = !args.no_progress
        && ctx.format == OutputFormat::Text
        && std::io::stderr().is_terminal();

    let mut options = RunOptions::new(&input, &name);
    options.restart = args.restart;
    options.progress = if show_progress {
        progress_bar()
    } else {
        ProgressBar::hidden()
    };

    info!(name = %name, input = %input.display(), "embedding corpus");
    let pipeline = EmbeddingPipeline::new(
        config.clone(),
        embedder,
        store.clone(),
        monitor.subscribe(),
    );
    let result = pipeline.run(&options, ctx.cancel.clone()).await;
    monitor.shutdown().await;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            print!("{}", formatter.format_run_counts(&e.counts));
            if config.checkpoint.enabled {
                eprintln!(
                    "Progress is checkpointed under {}; rerun the same command to resume.",
                    config.checkpoint.dir.display()
                );
            }
            return Err(e.error.into());
        }
    };
    print!("{}", formatter.format_run_summary(&summary));

    if args.analyze {
        let params = AnalysisParams::from(&config.analysis);
        run_analysis(
            store.as_ref(),
            &name,
            &params,
            &config.analysis.output_dir,
            None,
            formatter.as_ref(),
        )
        .await?;
    }

    Ok(())
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}
