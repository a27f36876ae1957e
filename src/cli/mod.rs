//! CLI module for the corpus embedding tool.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::models::OutputFormat;

/// Embed JSONL corpora into vector-store collections and analyze the result.
#[derive(Debug, Parser)]
#[command(name = "chunkvec")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "CHUNKVEC_CONFIG",
        help = "Configuration file (default: ./chunkvec.toml, then the global config)"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        short = 'f',
        global = true,
        help = "Output format: text, json, or markdown"
    )]
    pub format: Option<OutputFormat>,

    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Embed a JSONL corpus into a collection
    Embed(commands::EmbedArgs),

    /// Project, cluster and render a finalized collection
    Analyze(commands::AnalyzeArgs),

    /// Inspect and manage collections
    #[command(subcommand)]
    Collections(commands::CollectionsCommand),

    /// Check a corpus file without embedding it
    Validate(commands::ValidateArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::ConfigCommand),

    /// Show resources, embedding backend and vector store status
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_embed_flags() {
        let cli = Cli::try_parse_from([
            "chunkvec",
            "embed",
            "data/corpus.jsonl",
            "--task",
            "classification",
            "--truncate-dim",
            "256",
            "--restart",
            "-f",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, Some(OutputFormat::Json));
        let Commands::Embed(args) = cli.command else {
            panic!("expected embed");
        };
        assert_eq!(args.input.as_deref(), Some(std::path::Path::new("data/corpus.jsonl")));
        assert_eq!(args.truncate_dim, Some(256));
        assert!(args.restart);
    }

    #[test]
    fn test_parse_collections_search() {
        let cli =
            Cli::try_parse_from(["chunkvec", "collections", "search", "docs", "rust tips", "-n", "3"])
                .unwrap();
        match cli.command {
            Commands::Collections(commands::CollectionsCommand::Search { name, query, limit }) => {
                assert_eq!(name, "docs");
                assert_eq!(query, "rust tips");
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
