use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EmbedOptions, Embedder, Embeddings, truncate_embedding};
use crate::error::{EmbeddingError, is_memory_message};
use crate::models::{EmbeddingConfig, EmbeddingTask};

/// Request body for the /embed endpoint.
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    task: EmbeddingTask,
    max_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    truncate_dim: Option<usize>,
}

/// Response from the /embed endpoint: either a bare list of vectors or an
/// object carrying usage information.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbedResponse {
    Vectors(Vec<Vec<f32>>),
    WithUsage {
        embeddings: Vec<Vec<f32>>,
        #[serde(default)]
        usage: Option<Usage>,
    },
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

/// Client for a remote embedding server.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model_name: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model_name: config.model.clone(),
            dimension: config.dimension,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        options: &EmbedOptions,
    ) -> Result<Embeddings, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Embeddings::default());
        }

        let url = format!("{}/embed", self.base_url);
        let request = EmbedRequest {
            inputs: texts,
            task: options.task,
            max_length: options.max_length,
            truncate_dim: options.truncate_dim,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Timeout
                } else if e.is_connect() {
                    EmbeddingError::ConnectionError(e.to_string())
                } else {
                    EmbeddingError::RequestError(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let (vectors, token_count) = match response
            .json::<EmbedResponse>()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?
        {
            EmbedResponse::Vectors(v) => (v, None),
            EmbedResponse::WithUsage { embeddings, usage } => {
                (embeddings, usage.map(|u| u.total_tokens))
            }
        };

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        debug!(count = vectors.len(), "received embeddings");

        Ok(Embeddings {
            vectors: vectors
                .into_iter()
                .map(|v| truncate_embedding(v, options.truncate_dim))
                .collect(),
            token_count,
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn health_check(&self) -> Result<(), EmbeddingError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EmbeddingError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbeddingError::ServerError(format!(
                "health check failed with status: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Map an error status to resource exhaustion, rejected input or a server error.
fn classify_status(status: StatusCode, body: &str) -> EmbeddingError {
    let detail = format!("status {status}: {body}");
    match status.as_u16() {
        429 | 503 | 507 => EmbeddingError::ResourceExhausted(detail),
        400 | 413 | 422 => EmbeddingError::InvalidInput(detail),
        _ if is_memory_message(body) => EmbeddingError::ResourceExhausted(detail),
        _ => EmbeddingError::ServerError(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Retryable;

    #[test]
    fn test_client_creation() {
        let config = EmbeddingConfig::default();
        assert!(HttpEmbedder::new(&config).is_ok());
    }

    #[test]
    fn test_base_url_trimming() {
        let config = EmbeddingConfig {
            url: "http://localhost:11411/".to_string(),
            ..Default::default()
        };
        let client = HttpEmbedder::new(&config).unwrap();
        assert_eq!(client.base_url(), "http://localhost:11411");
    }

    #[test]
    fn test_classify_status() {
        let err = classify_status(StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert!(matches!(err, EmbeddingError::ResourceExhausted(_)));
        assert!(err.is_retryable());

        let err = classify_status(StatusCode::PAYLOAD_TOO_LARGE, "too long");
        assert!(matches!(err, EmbeddingError::InvalidInput(_)));
        assert!(!err.is_retryable());

        let err = classify_status(StatusCode::INTERNAL_SERVER_ERROR, "CUDA out of memory");
        assert!(matches!(err, EmbeddingError::ResourceExhausted(_)));

        let err = classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, EmbeddingError::ServerError(_)));
    }

    #[test]
    fn test_request_serialization() {
        let inputs = vec!["a".to_string()];
        let request = EmbedRequest {
            inputs: &inputs,
            task: EmbeddingTask::RetrievalPassage,
            max_length: 512,
            truncate_dim: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["task"], "retrieval.passage");
        assert!(json.get("truncate_dim").is_none());
    }

    #[test]
    fn test_response_shapes() {
        let bare: EmbedResponse = serde_json::from_str("[[0.1, 0.2]]").unwrap();
        assert!(matches!(bare, EmbedResponse::Vectors(ref v) if v.len() == 1));

        let wrapped: EmbedResponse =
            serde_json::from_str(r#"{"embeddings": [[1.0]], "usage": {"total_tokens": 7}}"#)
                .unwrap();
        assert!(matches!(
            wrapped,
            EmbedResponse::WithUsage { usage: Some(Usage { total_tokens: 7 }), .. }
        ));
    }
}
