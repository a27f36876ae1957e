use std::time::Duration;

use anyhow::Result;

use super::CommandContext;
use crate::cli::output::StatusInfo;
use crate::models::{EmbeddingBackend, EmbeddingConfig, VectorDriver};
use crate::services::embedding::{create_embedder, resolve_model_dir};
use crate::services::monitor::Sampler;
use crate::services::vector_store::create_backend;

pub async fn handle_status(ctx: &CommandContext) -> Result<()> {
    let config = &ctx.config;
    let formatter = ctx.formatter();

    let mut sampler = Sampler::new(config.monitor.gpu);
    sampler.prime().await;
    let resources = sampler.sample().await;

    let (embedding_target, embedding_ready) = embedding_status(&config.embedding).await;

    let (vector_store_connected, collections) =
        if let Ok(store) = create_backend(&config.vector_store).await {
            let connected = store.health_check().await.unwrap_or(false);
            let collections = if connected {
                store.list_collections().await.map_or(0, |c| c.len())
            } else {
                0
            };
            (connected, collections)
        } else {
            (false, 0)
        };

    let status = StatusInfo {
        config_path: ctx.config_path.as_ref().map(|p| p.display().to_string()),
        embedding_backend: config.embedding.backend.to_string(),
        embedding_model: config.embedding.model.clone(),
        embedding_target,
        embedding_ready,
        vector_store_driver: config.vector_store.driver.to_string(),
        vector_store_location: config.vector_store.location(),
        vector_store_connected,
        collections,
        resources,
    };

    print!("{}", formatter.format_status(&status));

    if !embedding_ready || !vector_store_connected {
        eprintln!();
        if !embedding_ready {
            match config.embedding.backend {
                EmbeddingBackend::Onnx => eprintln!(
                    "Hint: no ONNX model found. Place model.onnx and tokenizer.json in {}",
                    status.embedding_target
                ),
                EmbeddingBackend::Http => eprintln!(
                    "Warning: embedding server not reachable at {}",
                    config.embedding.url
                ),
            }
        }
        if !vector_store_connected {
            match config.vector_store.driver {
                VectorDriver::Qdrant => {
                    eprintln!(
                        "Warning: Qdrant not reachable at {}",
                        config.vector_store.url
                    );
                }
                VectorDriver::Sqlite => {
                    eprintln!("Warning: SQLite database could not be opened. Check db_path.");
                }
            }
        }
    }

    Ok(())
}

async fn embedding_status(config: &EmbeddingConfig) -> (String, bool) {
    match config.backend {
        EmbeddingBackend::Onnx => match resolve_model_dir(config) {
            Ok(dir) => {
                let ready = dir.join("model.onnx").exists() && dir.join("tokenizer.json").exists();
                (dir.display().to_string(), ready)
            }
            Err(_) => ("<unknown>".to_string(), false),
        },
        EmbeddingBackend::Http => {
            let ready = match create_embedder(config) {
                Ok(embedder) => {
                    tokio::time::timeout(Duration::from_secs(5), embedder.health_check())
                        .await
                        .is_ok_and(|r| r.is_ok())
                }
                Err(_) => false,
            };
            (config.url.clone(), ready)
        }
    }
}
