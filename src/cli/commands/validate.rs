use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use super::CommandContext;
use crate::services::validator::validate_corpus;

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// JSONL corpus to check
    pub input: PathBuf,

    /// Also write the full report as JSON
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

pub async fn handle_validate(args: ValidateArgs, ctx: &CommandContext) -> Result<()> {
    let formatter = ctx.formatter();
    let input = args.input.clone();
    let report = tokio::task::spawn_blocking(move || validate_corpus(&input))
        .await
        .context("validation task failed")?
        .with_context(|| format!("failed to validate {}", args.input.display()))?;

    print!("{}", formatter.format_validation(&report));

    if let Some(ref path) = args.output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        println!(
            "{}",
            formatter.format_message(&format!("Report saved to {}", path.display()))
        );
    }

    if !report.passed {
        anyhow::bail!(
            "validation failed with {} error(s) in {}",
            report.errors.len(),
            args.input.display()
        );
    }
    Ok(())
}
