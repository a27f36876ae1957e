use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use super::CommandContext;
use crate::analysis::{
    AnalysisParams, analyze_collection, export_assignments, write_visualization,
};
use crate::cli::output::Formatter;
use crate::services::vector_store::VectorStore;

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Logical or physical collection name
    pub name: String,

    /// Maximum number of points to sample
    #[arg(long, short = 'p')]
    pub max_points: Option<usize>,

    /// Random seed for sampling, projection and clustering
    #[arg(long, short = 's')]
    pub seed: Option<u64>,

    /// Number of clusters
    #[arg(long, short = 'k')]
    pub clusters: Option<usize>,

    /// Centroid distance, in standard deviations, beyond which a point is an outlier
    #[arg(long, short = 'o')]
    pub outlier_threshold: Option<f64>,

    /// t-SNE perplexity
    #[arg(long)]
    pub perplexity: Option<f64>,

    /// t-SNE iterations
    #[arg(long)]
    pub iterations: Option<usize>,

    /// Directory for the HTML artifact
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Also write cluster assignments as JSON
    #[arg(long)]
    pub export: Option<PathBuf>,
}

impl AnalyzeArgs {
    fn params(&self, base: AnalysisParams) -> AnalysisParams {
        AnalysisParams {
            max_points: self.max_points.unwrap_or(base.max_points),
            seed: self.seed.unwrap_or(base.seed),
            clusters: self.clusters.unwrap_or(base.clusters),
            outlier_threshold: self.outlier_threshold.unwrap_or(base.outlier_threshold),
            perplexity: self.perplexity.unwrap_or(base.perplexity),
            iterations: self.iterations.unwrap_or(base.iterations),
        }
    }
}

pub async fn handle_analyze(args: AnalyzeArgs, ctx: &CommandContext) -> Result<()> {
    let formatter = ctx.formatter();
    let params = args.params(AnalysisParams::from(&ctx.config.analysis));
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| ctx.config.analysis.output_dir.clone());

    let store = super::open_store(&ctx.config).await?;
    run_analysis(
        store.as_ref(),
        &args.name,
        &params,
        &output_dir,
        args.export.as_deref(),
        formatter.as_ref(),
    )
    .await
}

pub(crate) async fn run_analysis(
    store: &dyn VectorStore,
    name: &str,
    params: &AnalysisParams,
    output_dir: &Path,
    export: Option<&Path>,
    formatter: &dyn Formatter,
) -> Result<()> {
    let report = analyze_collection(store, name, params)
        .await
        .with_context(|| format!("failed to analyze collection '{name}'"))?;

    let artifact = write_visualization(&report, params, output_dir)
        .with_context(|| format!("failed to write visualization to {}", output_dir.display()))?;
    if let Some(path) = export {
        export_assignments(&report, path)
            .with_context(|| format!("failed to export assignments to {}", path.display()))?;
    }

    print!("{}", formatter.format_analysis(&report, &artifact));
    Ok(())
}
