use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use chunkvec::cli::commands::{
    CommandContext, handle_analyze, handle_collections, handle_config, handle_embed,
    handle_status, handle_validate,
};
use chunkvec::cli::output::get_formatter;
use chunkvec::cli::{Cli, Commands};
use chunkvec::PipelineError;
use chunkvec::models::{Config, LoadedConfig};

/// Detect ONNX Runtime library path and set ORT_DYLIB_PATH if not already set.
/// Must be called before any ort code runs.
fn detect_and_set_ort_path() {
    if std::env::var("ORT_DYLIB_PATH")
        .map(|p| Path::new(&p).exists())
        .unwrap_or(false)
    {
        return;
    }

    let home = std::env::var("HOME").unwrap_or_default();

    let found = if cfg!(target_os = "macos") {
        [
            format!("{home}/.local/lib/chunkvec/libonnxruntime.dylib"),
            "/opt/homebrew/opt/onnxruntime/lib/libonnxruntime.dylib".into(),
            "/usr/local/opt/onnxruntime/lib/libonnxruntime.dylib".into(),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
    } else if cfg!(target_os = "linux") {
        [
            format!("{home}/.local/lib/chunkvec/libonnxruntime.so"),
            "/usr/lib/libonnxruntime.so".into(),
            "/usr/local/lib/libonnxruntime.so".into(),
            "/usr/lib/x86_64-linux-gnu/libonnxruntime.so".into(),
            "/usr/lib/aarch64-linux-gnu/libonnxruntime.so".into(),
        ]
        .into_iter()
        .find(|p| Path::new(p).exists())
    } else {
        None
    };

    if let Some(path) = found {
        // SAFETY: Called at program start before any threads are spawned.
        unsafe {
            std::env::set_var("ORT_DYLIB_PATH", path);
        }
    }
}

fn init_tracing(verbose: bool, config_level: &str) -> Result<()> {
    let level = if verbose { "debug" } else { config_level };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;
    Ok(())
}

fn main() -> ExitCode {
    detect_and_set_ort_path();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let LoadedConfig { config, path } = match Config::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            let format = cli.format.unwrap_or_default();
            eprintln!("{}", get_formatter(format).format_error(&e.to_string()));
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(cli.verbose, &config.log_level) {
        eprintln!("Warning: {e:#}");
    }

    let format = cli.format.unwrap_or(config.output.format);
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            warn!("received shutdown signal, finishing the current batch");
            cancel.cancel();
        }
    });

    let ctx = CommandContext {
        config,
        config_path: path,
        format,
        cancel,
    };

    match run_command(cli.command, &ctx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", ctx.formatter().format_error(&format!("{e:#}")));
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run_command(command: Commands, ctx: &CommandContext) -> Result<()> {
    match command {
        Commands::Embed(args) => handle_embed(args, ctx).await,
        Commands::Analyze(args) => handle_analyze(args, ctx).await,
        Commands::Collections(cmd) => handle_collections(cmd, ctx).await,
        Commands::Validate(args) => handle_validate(args, ctx).await,
        Commands::Config(cmd) => handle_config(cmd, ctx).await,
        Commands::Status => handle_status(ctx).await,
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    error
        .downcast_ref::<PipelineError>()
        .map_or(1, |e| u8::try_from(e.exit_code()).unwrap_or(1))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
