mod analyze;
mod collections;
mod config;
mod embed;
mod status;
mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::cli::output::{Formatter, get_formatter};
use crate::models::{Config, OutputFormat};
use crate::services::vector_store::{VectorStore, create_backend};

pub use analyze::AnalyzeArgs;
pub use collections::CollectionsCommand;
pub use config::ConfigCommand;
pub use embed::EmbedArgs;
pub use validate::ValidateArgs;

pub use analyze::handle_analyze;
pub use collections::handle_collections;
pub use config::handle_config;
pub use embed::handle_embed;
pub use status::handle_status;
pub use validate::handle_validate;

/// Everything a command handler needs besides its own arguments.
pub struct CommandContext {
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub format: OutputFormat,
    pub cancel: CancellationToken,
}

impl CommandContext {
    pub fn formatter(&self) -> Box<dyn Formatter> {
        get_formatter(self.format)
    }
}

pub(crate) async fn open_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    let store = create_backend(&config.vector_store)
        .await
        .with_context(|| {
            format!(
                "failed to open {} vector store at {}",
                config.vector_store.driver,
                config.vector_store.location()
            )
        })?;
    Ok(Arc::from(store))
}
