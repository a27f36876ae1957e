//! Collection management commands.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use tracing::warn;

use super::CommandContext;
use crate::analysis::sample_ids;
use crate::cli::output::{
    CollectionDetail, CollectionRow, SampleRecord, SearchHitRow, SearchOutput,
};
use crate::models::{EmbeddingTask, Metadata};
use crate::services::embedding::{EmbedOptions, create_embedder};
use crate::services::validator::LengthStats;
use crate::services::vector_store::{VectorStore, resolve_collection};
use crate::utils::preview;

const INSPECT_SAMPLES: usize = 3;
const LENGTH_SAMPLE: usize = 1000;

#[derive(Debug, Subcommand)]
pub enum CollectionsCommand {
    /// List collections with their manifests
    List,

    /// Show a collection's manifest, sample records and text statistics
    Inspect {
        /// Logical or physical collection name
        name: String,
    },

    /// Rank documents by similarity to a query
    Search {
        /// Logical or physical collection name
        name: String,

        /// Query text
        query: String,

        /// Number of results
        #[arg(long, short = 'n', default_value_t = 5)]
        limit: usize,
    },

    /// Delete a collection
    Delete {
        /// Logical or physical collection name
        name: String,

        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        force: bool,
    },

    /// Export ids, documents, metadata and embeddings as JSON
    Export {
        /// Logical or physical collection name
        name: String,

        /// Output file
        file: PathBuf,

        /// Export at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },
}

pub async fn handle_collections(cmd: CollectionsCommand, ctx: &CommandContext) -> Result<()> {
    let store = super::open_store(&ctx.config).await?;
    let store = store.as_ref();

    match cmd {
        CollectionsCommand::List => handle_list(store, ctx).await,
        CollectionsCommand::Inspect { name } => handle_inspect(store, &name, ctx).await,
        CollectionsCommand::Search { name, query, limit } => {
            handle_search(store, &name, &query, limit, ctx).await
        }
        CollectionsCommand::Delete { name, force } => handle_delete(store, &name, force, ctx).await,
        CollectionsCommand::Export { name, file, limit } => {
            handle_export(store, &name, file, limit, ctx).await
        }
    }
}

async fn resolve(store: &dyn VectorStore, name: &str) -> Result<String> {
    resolve_collection(store, name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("collection not found: {name}"))
}

async fn collection_row(
    store: &dyn VectorStore,
    collection: &str,
    aliases: &HashMap<String, String>,
) -> Result<CollectionRow> {
    let info = store
        .collection_info(collection)
        .await?
        .ok_or_else(|| anyhow::anyhow!("collection not found: {collection}"))?;
    let manifest = store.get_manifest(collection).await?;

    Ok(CollectionRow {
        name: aliases.get(collection).cloned(),
        collection: collection.to_string(),
        points: info.points_count,
        dimension: info.dimension,
        model: manifest.as_ref().map(|m| m.model_name.clone()),
        task: manifest.as_ref().map(|m| m.task.to_string()),
        complete: manifest.as_ref().is_some_and(|m| m.is_complete()),
    })
}

async fn alias_map(store: &dyn VectorStore) -> Result<HashMap<String, String>> {
    Ok(store
        .list_aliases()
        .await?
        .into_iter()
        .map(|(alias, collection)| (collection, alias))
        .collect())
}

async fn handle_list(store: &dyn VectorStore, ctx: &CommandContext) -> Result<()> {
    let aliases = alias_map(store).await?;
    let mut rows = Vec::new();
    for collection in store.list_collections().await? {
        rows.push(collection_row(store, &collection, &aliases).await?);
    }
    print!("{}", ctx.formatter().format_collections(&rows));
    Ok(())
}

async fn handle_inspect(store: &dyn VectorStore, name: &str, ctx: &CommandContext) -> Result<()> {
    let collection = resolve(store, name).await?;
    let aliases = alias_map(store).await?;
    let row = collection_row(store, &collection, &aliases).await?;
    let manifest = store.get_manifest(&collection).await?;

    let ids = store.list_ids(&collection).await?;
    let sampled = sample_ids(&ids, LENGTH_SAMPLE, ctx.config.analysis.seed);
    let records = store.fetch(&collection, &sampled).await?;
    let text_length = LengthStats::from_lengths(
        records.iter().map(|r| r.text.chars().count()).collect(),
    );
    let samples = records
        .iter()
        .take(INSPECT_SAMPLES)
        .map(|r| SampleRecord {
            id: r.id.clone(),
            source: r.source.clone(),
            preview: preview(&r.text, 200),
            metadata: r.metadata.clone(),
        })
        .collect();

    let detail = CollectionDetail {
        row,
        created_at: manifest.as_ref().map(|m| m.created_at.to_rfc3339()),
        finalized_at: manifest
            .as_ref()
            .and_then(|m| m.finalized_at)
            .map(|t| t.to_rfc3339()),
        samples,
        text_length,
    };
    print!("{}", ctx.formatter().format_collection_detail(&detail));
    Ok(())
}

async fn handle_search(
    store: &dyn VectorStore,
    name: &str,
    query: &str,
    limit: usize,
    ctx: &CommandContext,
) -> Result<()> {
    let collection = resolve(store, name).await?;
    let manifest = store
        .get_manifest(&collection)
        .await?
        .ok_or_else(|| anyhow::anyhow!("collection '{collection}' has no manifest"))?;

    let mut embedding = ctx.config.embedding.clone();
    if embedding.model != manifest.model_name {
        warn!(
            configured = %embedding.model,
            collection_model = %manifest.model_name,
            "using the collection's model for the query"
        );
        embedding.model = manifest.model_name.clone();
    }
    if manifest.dimensionality < embedding.dimension {
        embedding.truncate_dim = Some(manifest.dimensionality);
    }

    let embedder = create_embedder(&embedding)
        .with_context(|| format!("failed to initialize embedding model {}", embedding.model))?;
    let options = EmbedOptions::from_config(&embedding).with_task(EmbeddingTask::RetrievalQuery);
    let vector = embedder.embed_one(query, &options).await?;

    let hits = store.query(&collection, &vector, limit).await?;
    let output = SearchOutput {
        collection,
        query: query.to_string(),
        hits: hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| SearchHitRow {
                rank: i + 1,
                similarity: hit.similarity(),
                preview: preview(&hit.text, 200),
                id: hit.id,
                source: hit.source,
            })
            .collect(),
    };
    print!("{}", ctx.formatter().format_search(&output));
    Ok(())
}

async fn handle_delete(
    store: &dyn VectorStore,
    name: &str,
    force: bool,
    ctx: &CommandContext,
) -> Result<()> {
    let formatter = ctx.formatter();
    let collection = resolve(store, name).await?;

    if !force {
        println!("This will delete collection '{collection}'. Continue? [y/N]");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("{}", formatter.format_message("Cancelled."));
            return Ok(());
        }
    }

    for (alias, target) in store.list_aliases().await? {
        if target == collection {
            store.delete_alias(&alias).await?;
        }
    }
    store.delete_collection(&collection).await?;

    println!(
        "{}",
        formatter.format_message(&format!("Deleted collection: {collection}"))
    );
    Ok(())
}

#[derive(Serialize)]
struct ExportFile {
    collection: String,
    ids: Vec<String>,
    documents: Vec<String>,
    metadatas: Vec<Metadata>,
    embeddings: Vec<Vec<f32>>,
}

async fn handle_export(
    store: &dyn VectorStore,
    name: &str,
    file: PathBuf,
    limit: Option<usize>,
    ctx: &CommandContext,
) -> Result<()> {
    let collection = resolve(store, name).await?;
    let mut ids = store.list_ids(&collection).await?;
    if let Some(limit) = limit {
        ids.truncate(limit);
    }
    let records = store.fetch(&collection, &ids).await?;

    let mut export = ExportFile {
        collection: collection.clone(),
        ids: Vec::with_capacity(records.len()),
        documents: Vec::with_capacity(records.len()),
        metadatas: Vec::with_capacity(records.len()),
        embeddings: Vec::with_capacity(records.len()),
    };
    for record in records {
        let mut metadata = record.metadata;
        metadata.insert("source".to_string(), record.source.as_str().into());
        export.ids.push(record.id);
        export.documents.push(record.text);
        export.metadatas.push(metadata);
        export.embeddings.push(record.vector);
    }

    if let Some(parent) = file.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&export)?;
    std::fs::write(&file, json)
        .with_context(|| format!("failed to write {}", file.display()))?;

    println!(
        "{}",
        ctx.formatter().format_message(&format!(
            "Exported {} records from {} to {}",
            export.ids.len(),
            collection,
            file.display()
        ))
    );
    Ok(())
}
