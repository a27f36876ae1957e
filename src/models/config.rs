use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::output::OutputFormat;
use super::task::{Device, EmbeddingTask};
use crate::error::ConfigError;

pub const DEFAULT_MODEL: &str = "jinaai/jina-embeddings-v3";
pub const DEFAULT_MODEL_DIMENSION: usize = 1024;
pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11411";
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
pub const DEFAULT_DB_PATH: &str = "artifacts/vector_stores/chunkvec.db";
pub const DEFAULT_MANIFEST_PATH: &str = "artifacts/vector_stores/collections.txt";
pub const DEFAULT_CHECKPOINT_DIR: &str = "artifacts/checkpoints";
pub const DEFAULT_VISUALIZATION_DIR: &str = "artifacts/visualizations";
pub const PROJECT_CONFIG_FILE: &str = "chunkvec.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub batching: BatchingConfig,

    #[serde(default)]
    pub vector_store: VectorStoreConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            input: InputConfig::default(),
            embedding: EmbeddingConfig::default(),
            batching: BatchingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            checkpoint: CheckpointConfig::default(),
            monitor: MonitorConfig::default(),
            analysis: AnalysisConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A loaded configuration together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: Option<PathBuf>,
}

impl Config {
    pub fn global_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("chunkvec").join("config.toml"))
    }

    pub fn project_path() -> Option<PathBuf> {
        std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(PROJECT_CONFIG_FILE))
    }

    /// Resolve the active config file: explicit path, then `./chunkvec.toml`,
    /// then the global config. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let path = match explicit {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::PathError(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                Some(p.to_path_buf())
            }
            None => [Self::project_path(), Self::global_path()]
                .into_iter()
                .flatten()
                .find(|p| p.exists()),
        };

        let mut config = match path {
            Some(ref p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();

        Ok(LoadedConfig { config, path })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CHUNKVEC_DB_PATH") {
            self.vector_store.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHUNKVEC_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("CHUNKVEC_DEVICE")
            && let Ok(device) = v.parse()
        {
            self.embedding.device = device;
        }
        if let Ok(v) = std::env::var("CHUNKVEC_QDRANT_URL") {
            self.vector_store.url = v;
        }
        if let Ok(v) = std::env::var("CHUNKVEC_EMBEDDING_URL") {
            self.embedding.url = v;
        }
    }

    /// Eager validation of every option that does not depend on the input file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.embedding.model.trim().is_empty() {
            return invalid("embedding.model must not be empty".into());
        }
        if self.embedding.max_length == 0 {
            return invalid("embedding.max_length must be greater than 0".into());
        }
        if self.embedding.dimension == 0 {
            return invalid("embedding.dimension must be greater than 0".into());
        }
        if let Some(dim) = self.embedding.truncate_dim {
            if dim == 0 {
                return invalid("embedding.truncate_dim must be greater than 0".into());
            }
            if dim > self.embedding.dimension {
                return invalid(format!(
                    "embedding.truncate_dim ({}) exceeds model dimension ({})",
                    dim, self.embedding.dimension
                ));
            }
        }

        let b = &self.batching;
        if b.min_batch_size == 0 {
            return invalid("batching.min_batch_size must be at least 1".into());
        }
        if b.min_batch_size > b.max_batch_size {
            return invalid(format!(
                "batching.min_batch_size ({}) exceeds max_batch_size ({})",
                b.min_batch_size, b.max_batch_size
            ));
        }
        if b.batch_size < b.min_batch_size || b.batch_size > b.max_batch_size {
            return invalid(format!(
                "batching.batch_size ({}) must lie within [{}, {}]",
                b.batch_size, b.min_batch_size, b.max_batch_size
            ));
        }
        if b.stable_batches == 0 {
            return invalid("batching.stable_batches must be at least 1".into());
        }
        if !(b.memory_threshold_percent > 0.0 && b.memory_threshold_percent <= 100.0) {
            return invalid("batching.memory_threshold_percent must be in (0, 100]".into());
        }
        if !(b.comfort_ratio > 0.0 && b.comfort_ratio < 1.0) {
            return invalid("batching.comfort_ratio must be in (0, 1)".into());
        }
        if b.latency_high_water_ms == 0 {
            return invalid("batching.latency_high_water_ms must be greater than 0".into());
        }

        if self.monitor.interval_ms == 0 {
            return invalid("monitor.interval_ms must be greater than 0".into());
        }

        let a = &self.analysis;
        if a.clusters == 0 {
            return invalid("analysis.clusters must be at least 1".into());
        }
        if a.max_points == 0 {
            return invalid("analysis.max_points must be at least 1".into());
        }
        if !a.outlier_threshold.is_finite() || a.outlier_threshold < 0.0 {
            return invalid("analysis.outlier_threshold must be a non-negative number".into());
        }
        if !a.perplexity.is_finite() || a.perplexity <= 0.0 {
            return invalid("analysis.perplexity must be a positive number".into());
        }

        if let Some(ref name) = self.vector_store.collection
            && name.trim().is_empty()
        {
            return invalid("vector_store.collection must not be empty".into());
        }

        Ok(())
    }

    /// Validation for the `embed` command: everything in [`Config::validate`]
    /// plus the presence of a readable input file.
    pub fn validate_for_run(&self) -> Result<PathBuf, ConfigError> {
        self.validate()?;
        let input = self
            .input
            .path
            .clone()
            .ok_or_else(|| ConfigError::ValidationError("input path is required".into()))?;
        if !input.is_file() {
            return Err(ConfigError::MissingInput(input));
        }
        Ok(input)
    }
}

/// What to do with a line that is not a valid record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Stop the run at the first malformed record.
    Abort,
    /// Count the record as skipped and continue.
    #[default]
    Skip,
}

/// What to do when a document id repeats within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Fail the run on the first repeated id.
    Reject,
    /// Keep the first occurrence and skip later ones.
    #[default]
    Skip,
}

impl std::str::FromStr for MalformedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            _ => Err(format!("unknown malformed policy: {s}")),
        }
    }
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "skip" => Ok(Self::Skip),
            _ => Err(format!("unknown duplicate policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub malformed_policy: MalformedPolicy,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Seek past the checkpoint's last offset instead of re-reading from the top.
    #[serde(default)]
    pub resume_from_offset: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Onnx,
    Http,
}

impl std::str::FromStr for EmbeddingBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "http" => Ok(Self::Http),
            _ => Err(format!("unknown embedding backend: {s} (expected onnx or http)")),
        }
    }
}

impl std::fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingBackend::Onnx => write!(f, "onnx"),
            EmbeddingBackend::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,

    #[serde(default = "default_model")]
    pub model: String,

    /// Directory holding `model.onnx` and `tokenizer.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub task: EmbeddingTask,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate_dim: Option<usize>,

    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Native output dimension of the model.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default)]
    pub device: Device,

    /// Per-task instruction prefixes, keyed by task name. Unset tasks use the
    /// built-in prompt set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prompts: BTreeMap<String, String>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_embedding_url() -> String {
    DEFAULT_EMBEDDING_URL.to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_max_length() -> usize {
    8192
}

fn default_dimension() -> usize {
    DEFAULT_MODEL_DIMENSION
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: default_model(),
            model_path: None,
            url: default_embedding_url(),
            timeout_secs: default_timeout(),
            task: EmbeddingTask::default(),
            truncate_dim: None,
            max_length: default_max_length(),
            dimension: default_dimension(),
            device: Device::default(),
            prompts: BTreeMap::new(),
        }
    }
}

impl EmbeddingConfig {
    /// Dimension of the vectors that end up in the store.
    pub fn output_dimension(&self) -> usize {
        self.truncate_dim.unwrap_or(self.dimension)
    }

    /// Last path segment of the model name (`org/model` → `model`).
    pub fn model_short_name(&self) -> &str {
        self.model.rsplit('/').next().unwrap_or(&self.model)
    }

    pub fn prompt_for(&self, task: EmbeddingTask) -> &str {
        self.prompts
            .get(task.as_str())
            .map(String::as_str)
            .unwrap_or_else(|| task.default_prompt())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Initial batch size (documents per embedding call).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_increase_step")]
    pub increase_step: usize,

    /// Consecutive comfortable batches required before growing.
    #[serde(default = "default_stable_batches")]
    pub stable_batches: u32,

    #[serde(default = "default_latency_high_water_ms")]
    pub latency_high_water_ms: u64,

    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_percent: f32,

    /// Fraction of each threshold below which a batch counts as comfortable.
    #[serde(default = "default_comfort_ratio")]
    pub comfort_ratio: f32,

    /// Retries after the first embedding attempt of a batch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_batch_size() -> usize {
    32
}

fn default_min_batch_size() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    128
}

fn default_increase_step() -> usize {
    4
}

fn default_stable_batches() -> u32 {
    3
}

fn default_latency_high_water_ms() -> u64 {
    30_000
}

fn default_memory_threshold() -> f32 {
    90.0
}

fn default_comfort_ratio() -> f32 {
    0.75
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            increase_step: default_increase_step(),
            stable_batches: default_stable_batches(),
            latency_high_water_ms: default_latency_high_water_ms(),
            memory_threshold_percent: default_memory_threshold(),
            comfort_ratio: default_comfort_ratio(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorDriver {
    #[default]
    Sqlite,
    Qdrant,
}

impl std::str::FromStr for VectorDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(format!("unknown vector store driver: {s} (expected sqlite or qdrant)")),
        }
    }
}

impl std::fmt::Display for VectorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorDriver::Sqlite => write!(f, "sqlite"),
            VectorDriver::Qdrant => write!(f, "qdrant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub driver: VectorDriver,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Logical collection name. Derived from the input file and model when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    /// Retries after the first write attempt of a batch.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_qdrant_url() -> String {
    DEFAULT_QDRANT_URL.to_string()
}

fn default_write_retries() -> u32 {
    3
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            driver: VectorDriver::default(),
            db_path: default_db_path(),
            url: default_qdrant_url(),
            api_key: None,
            collection: None,
            write_retries: default_write_retries(),
        }
    }
}

impl VectorStoreConfig {
    pub fn location(&self) -> String {
        match self.driver {
            VectorDriver::Sqlite => self.db_path.display().to_string(),
            VectorDriver::Qdrant => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CHECKPOINT_DIR)
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_checkpoint_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u64,

    /// Query `nvidia-smi` for GPU statistics.
    #[serde(default = "default_true")]
    pub gpu: bool,
}

fn default_monitor_interval() -> u64 {
    2000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval(),
            gpu: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_points")]
    pub max_points: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_clusters")]
    pub clusters: usize,

    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,

    #[serde(default = "default_perplexity")]
    pub perplexity: f64,

    #[serde(default = "default_iterations")]
    pub iterations: usize,

    #[serde(default = "default_visualization_dir")]
    pub output_dir: PathBuf,
}

fn default_max_points() -> usize {
    2000
}

fn default_seed() -> u64 {
    42
}

fn default_clusters() -> usize {
    10
}

fn default_outlier_threshold() -> f64 {
    3.0
}

fn default_perplexity() -> f64 {
    30.0
}

fn default_iterations() -> usize {
    750
}

fn default_visualization_dir() -> PathBuf {
    PathBuf::from(DEFAULT_VISUALIZATION_DIR)
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_points: default_max_points(),
            seed: default_seed(),
            clusters: default_clusters(),
            outlier_threshold: default_outlier_threshold(),
            perplexity: default_perplexity(),
            iterations: default_iterations(),
            output_dir: default_visualization_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,

    #[serde(default)]
    pub format: OutputFormat,
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from(DEFAULT_MANIFEST_PATH)
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            format: OutputFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.embedding.model, DEFAULT_MODEL);
        assert_eq!(config.batching.batch_size, 32);
        assert_eq!(config.vector_store.driver, VectorDriver::Sqlite);
    }

    #[test]
    fn test_retry_and_sampling_defaults() {
        let config = Config::default();
        assert_eq!(config.analysis.max_points, 2000);
        assert_eq!(config.batching.max_retries, 3);
        assert_eq!(config.vector_store.write_retries, 3);
    }

    #[test]
    fn test_output_dimension() {
        let mut config = EmbeddingConfig::default();
        assert_eq!(config.output_dimension(), 1024);
        config.truncate_dim = Some(256);
        assert_eq!(config.output_dimension(), 256);
    }

    #[test]
    fn test_model_short_name() {
        let config = EmbeddingConfig::default();
        assert_eq!(config.model_short_name(), "jina-embeddings-v3");
        let config = EmbeddingConfig {
            model: "local-model".to_string(),
            ..Default::default()
        };
        assert_eq!(config.model_short_name(), "local-model");
    }

    #[test]
    fn test_validate_rejects_truncate_dim_above_model_dimension() {
        let mut config = Config::default();
        config.embedding.truncate_dim = Some(4096);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_batch_bounds() {
        let mut config = Config::default();
        config.batching.min_batch_size = 64;
        config.batching.max_batch_size = 8;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batching.batch_size = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_for_run_requires_existing_input() {
        let mut config = Config::default();
        assert!(config.validate_for_run().is_err());

        config.input.path = Some(PathBuf::from("/definitely/not/here.jsonl"));
        assert!(matches!(
            config.validate_for_run(),
            Err(ConfigError::MissingInput(_))
        ));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [embedding]
            task = "retrieval.query"
            truncate_dim = 128

            [batching]
            batch_size = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.embedding.task, EmbeddingTask::RetrievalQuery);
        assert_eq!(config.embedding.truncate_dim, Some(128));
        assert_eq!(config.batching.batch_size, 16);
        assert_eq!(config.batching.max_batch_size, 128);
        assert_eq!(config.input.duplicate_policy, DuplicatePolicy::Skip);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.analysis.clusters = 4;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.config.analysis.clusters, 4);
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("ABORT".parse::<MalformedPolicy>(), Ok(MalformedPolicy::Abort));
        assert_eq!("reject".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::Reject));
        assert!("maybe".parse::<DuplicatePolicy>().is_err());
    }
}
