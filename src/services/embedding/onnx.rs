use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::{Session, SessionInputValue, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams, TruncationStrategy};
use tracing::{debug, info};

use super::{EmbedOptions, Embedder, Embeddings, truncate_embedding};
use crate::error::EmbeddingError;
use crate::models::{Device, EmbeddingConfig, EmbeddingTask};

/// Local ONNX model. Inference runs on the blocking thread pool.
pub struct OnnxEmbedder {
    model: Arc<OnnxModel>,
    model_name: String,
}

struct OnnxModel {
    session: Mutex<Session>,
    input_names: Vec<String>,
    tokenizer: Tokenizer,
    max_length: usize,
    dimension: usize,
    prompts: HashMap<EmbeddingTask, String>,
}

impl OnnxEmbedder {
    pub fn load(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let model_dir = resolve_model_dir(config)?;
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(EmbeddingError::ModelNotFound(format!(
                "{} (set embedding.model_path to a directory with model.onnx and tokenizer.json)",
                model_path.display()
            )));
        }

        let mut builder = Session::builder()
            .map_err(|e: ort::Error| EmbeddingError::LoadError(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e: ort::Error| EmbeddingError::LoadError(e.to_string()))?
            .with_intra_threads(num_cpus())
            .map_err(|e: ort::Error| EmbeddingError::LoadError(e.to_string()))?;

        builder = match config.device {
            Device::Cpu => builder,
            Device::Cuda => builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])
                .map_err(|e: ort::Error| EmbeddingError::LoadError(e.to_string()))?,
            Device::Auto => builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .map_err(|e: ort::Error| EmbeddingError::LoadError(e.to_string()))?,
        };

        let session = builder
            .commit_from_file(&model_path)
            .map_err(|e: ort::Error| EmbeddingError::from_inference_message(e.to_string()))?;
        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EmbeddingError::TokenizerError(e.to_string()))?;

        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_length,
                strategy: TruncationStrategy::LongestFirst,
                ..Default::default()
            }))
            .map_err(|e| EmbeddingError::TokenizerError(e.to_string()))?;

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        let prompts = EmbeddingTask::ALL
            .into_iter()
            .map(|task| (task, config.prompt_for(task).to_string()))
            .collect();

        info!(
            model = %config.model,
            path = %model_dir.display(),
            device = %config.device,
            "loaded ONNX embedding model"
        );

        Ok(Self {
            model: Arc::new(OnnxModel {
                session: Mutex::new(session),
                input_names,
                tokenizer,
                max_length: config.max_length,
                dimension: config.dimension,
                prompts,
            }),
            model_name: config.model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        options: &EmbedOptions,
    ) -> Result<Embeddings, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Embeddings::default());
        }

        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let options = *options;
        tokio::task::spawn_blocking(move || model.embed(&texts, &options))
            .await
            .map_err(|e| EmbeddingError::InferenceError(format!("inference task failed: {e}")))?
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.model.dimension
    }
}

impl OnnxModel {
    fn embed(&self, texts: &[String], options: &EmbedOptions) -> Result<Embeddings, EmbeddingError> {
        let prompt = self
            .prompts
            .get(&options.task)
            .map(String::as_str)
            .unwrap_or_default();
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{prompt}{t}")).collect();

        let encodings = self
            .tokenizer
            .encode_batch(prefixed, true)
            .map_err(|e| EmbeddingError::TokenizerError(e.to_string()))?;

        // The tokenizer truncates at the load-time limit; a smaller per-call
        // limit clips the encoded sequences.
        let limit = options.max_length.min(self.max_length).max(1);
        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len().min(limit))
            .max()
            .unwrap_or(0);
        let batch_size = encodings.len();

        let mut input_ids = vec![0i64; batch_size * seq_len];
        let mut attention_mask = vec![0i64; batch_size * seq_len];
        let mut token_count = 0u64;

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            for (j, (&id, &m)) in ids.iter().zip(mask.iter()).take(seq_len).enumerate() {
                input_ids[i * seq_len + j] = id as i64;
                attention_mask[i * seq_len + j] = m as i64;
                token_count += m as u64;
            }
        }

        let mut inputs: Vec<(String, SessionInputValue<'static>)> = Vec::new();
        for name in &self.input_names {
            let value: SessionInputValue<'static> = match name.as_str() {
                "input_ids" => tensor([batch_size, seq_len], input_ids.clone())?,
                "attention_mask" => tensor([batch_size, seq_len], attention_mask.clone())?,
                "token_type_ids" => tensor([batch_size, seq_len], vec![0i64; batch_size * seq_len])?,
                "position_ids" => {
                    let positions = (0..batch_size)
                        .flat_map(|_| 0..seq_len as i64)
                        .collect::<Vec<_>>();
                    tensor([batch_size, seq_len], positions)?
                }
                "task_id" => Tensor::from_array(([0usize; 0], vec![adapter_index(options.task)]))
                    .map_err(|e: ort::Error| EmbeddingError::InferenceError(e.to_string()))?
                    .into(),
                other => {
                    return Err(EmbeddingError::LoadError(format!(
                        "unsupported model input '{other}'"
                    )));
                }
            };
            inputs.push((name.clone(), value));
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbeddingError::InferenceError("session lock poisoned".to_string()))?;

        let outputs = session
            .run(inputs)
            .map_err(|e: ort::Error| EmbeddingError::from_inference_message(e.to_string()))?;

        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e: ort::Error| EmbeddingError::InferenceError(e.to_string()))?;
        let shape = output.shape().to_vec();
        debug!(?shape, batch_size, seq_len, "inference complete");

        let vectors: Vec<Vec<f32>> = match shape.as_slice() {
            // Token embeddings: mean-pool over the attention mask.
            [b, t, d] if *b == batch_size => (0..batch_size)
                .map(|i| {
                    let mut pooled = vec![0.0f32; *d];
                    let mut weight = 0.0f32;
                    for j in 0..*t {
                        if attention_mask[i * seq_len + j] == 0 {
                            continue;
                        }
                        weight += 1.0;
                        for (k, slot) in pooled.iter_mut().enumerate() {
                            *slot += output[[i, j, k]];
                        }
                    }
                    if weight > 0.0 {
                        pooled.iter_mut().for_each(|x| *x /= weight);
                    }
                    pooled
                })
                .collect(),
            [b, d] if *b == batch_size => (0..batch_size)
                .map(|i| (0..*d).map(|k| output[[i, k]]).collect())
                .collect(),
            _ => {
                return Err(EmbeddingError::InferenceError(format!(
                    "unexpected output shape: {shape:?}"
                )));
            }
        };

        let vectors = vectors
            .into_iter()
            .map(|v| truncate_embedding(v, options.truncate_dim))
            .collect();

        Ok(Embeddings {
            vectors,
            token_count: Some(token_count),
        })
    }
}

fn tensor(
    shape: [usize; 2],
    data: Vec<i64>,
) -> Result<SessionInputValue<'static>, EmbeddingError> {
    Tensor::from_array((shape, data))
        .map(Into::into)
        .map_err(|e: ort::Error| EmbeddingError::InferenceError(e.to_string()))
}

/// LoRA adapter index for task-conditioned models.
fn adapter_index(task: EmbeddingTask) -> i64 {
    match task {
        EmbeddingTask::RetrievalQuery => 0,
        EmbeddingTask::RetrievalPassage => 1,
        EmbeddingTask::Separation => 2,
        EmbeddingTask::Classification => 3,
        EmbeddingTask::TextMatching => 4,
    }
}

/// Explicit `model_path`, else `<data_dir>/chunkvec/models/<model short name>`.
pub fn resolve_model_dir(config: &EmbeddingConfig) -> Result<PathBuf, EmbeddingError> {
    if let Some(ref path) = config.model_path {
        return Ok(path.clone());
    }
    dirs::data_dir()
        .map(|d| {
            d.join("chunkvec")
                .join("models")
                .join(config.model_short_name())
        })
        .ok_or_else(|| {
            EmbeddingError::ModelNotFound("cannot determine data directory".to_string())
        })
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            model_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let err = OnnxEmbedder::load(&config).err().unwrap();
        assert!(matches!(err, EmbeddingError::ModelNotFound(_)));
    }

    #[test]
    fn test_model_dir_defaults_to_data_dir() {
        let config = EmbeddingConfig::default();
        if let Ok(dir) = resolve_model_dir(&config) {
            assert!(dir.ends_with(Path::new("models/jina-embeddings-v3")));
        }
    }

    #[test]
    fn test_adapter_indices_are_distinct() {
        let mut seen: Vec<i64> = EmbeddingTask::ALL.into_iter().map(adapter_index).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), EmbeddingTask::ALL.len());
    }
}
