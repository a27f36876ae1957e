use anyhow::{Context, Result};
use clap::Subcommand;

use super::CommandContext;
use crate::models::{Config, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    #[command(about = "Write a configuration file with every default spelled out")]
    Init {
        #[arg(
            long,
            short = 'g',
            help = "Create global config instead of project config"
        )]
        global: bool,
        #[arg(long, help = "Force overwrite existing config")]
        force: bool,
    },
    #[command(about = "Show the effective configuration")]
    Show,
    #[command(about = "Show configuration file paths")]
    Path {
        #[arg(long, help = "Show all possible config paths")]
        all: bool,
    },
}

pub async fn handle_config(cmd: ConfigCommand, ctx: &CommandContext) -> Result<()> {
    match cmd {
        ConfigCommand::Init { global, force } => handle_init(global, force, ctx),
        ConfigCommand::Show => handle_show(ctx),
        ConfigCommand::Path { all } => handle_path(all, ctx),
    }
}

fn handle_init(global: bool, force: bool, ctx: &CommandContext) -> Result<()> {
    let (scope, path) = if global {
        (
            "global",
            Config::global_path()
                .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?,
        )
    } else {
        (
            "project",
            Config::project_path()
                .ok_or_else(|| anyhow::anyhow!("could not determine project directory"))?,
        )
    };

    if path.exists() && !force {
        anyhow::bail!(
            "{scope} config already exists at: {}\nUse --force to overwrite.",
            path.display()
        );
    }

    Config::default()
        .save(&path)
        .with_context(|| format!("failed to create {scope} config"))?;
    println!(
        "{}",
        ctx.formatter()
            .format_message(&format!("Created {scope} config at: {}", path.display()))
    );
    Ok(())
}

fn handle_show(ctx: &CommandContext) -> Result<()> {
    if ctx.format == OutputFormat::Json {
        let output = serde_json::json!({
            "config": ctx.config,
            "path": ctx.config_path,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match ctx.config_path {
        Some(ref path) => println!("# Loaded from: {}", path.display()),
        None => println!("# No config file found, showing defaults"),
    }
    println!();
    print!("{}", toml::to_string_pretty(&ctx.config)?);
    Ok(())
}

fn handle_path(show_all: bool, ctx: &CommandContext) -> Result<()> {
    println!("Configuration paths:");
    println!();

    if let Some(ref path) = ctx.config_path {
        println!("Active config: {}", path.display());
    }

    if let Some(path) = Config::project_path() {
        if path.exists() {
            println!("Project config: {}", path.display());
        } else if show_all {
            println!("Project config (would be): {}", path.display());
        }
    }

    if let Some(path) = Config::global_path() {
        if path.exists() {
            println!("Global config: {}", path.display());
        } else if show_all {
            println!("Global config (would be): {}", path.display());
        }
    }

    if show_all && let Ok(cwd) = std::env::current_dir() {
        let env_path = cwd.join(".env");
        if env_path.exists() {
            println!(".env file (active): {}", env_path.display());
        } else {
            println!(".env file (would be): {}", env_path.display());
        }
    }

    Ok(())
}
