//! Embedding capability and an OpenAI-compatible HTTP client

use async_trait::async_trait;

use super::error::{IndexError, IndexResult};

/// Turns text into fixed-length vectors. Injected into the index manager;
/// the crate never implements a model itself.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order
    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>>;

    /// Embed a search query
    async fn embed_query(&self, text: &str) -> IndexResult<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Embedding("No embedding returned".to_string()))
    }

    /// Length of every vector this embedder produces
    fn dimensions(&self) -> usize;

    fn name(&self) -> &str {
        "embedder"
    }
}

#[cfg(feature = "openai")]
pub use self::openai::OpenAiEmbedder;

#[cfg(feature = "openai")]
mod openai {
    use async_trait::async_trait;
    use reqwest::{Client, StatusCode};
    use serde::{Deserialize, Serialize};

    use super::Embedder;
    use crate::config::EmbeddingConfig;
    use crate::error::{IndexError, IndexResult};

    /// Client for `POST {api_base}/embeddings`
    pub struct OpenAiEmbedder {
        config: EmbeddingConfig,
        client: Client,
        api_key: String,
    }

    #[derive(Debug, Serialize)]
    pub(super) struct EmbeddingRequest<'a> {
        pub model: &'a str,
        pub input: &'a [String],
        /// Only sent for models that support it (e.g. text-embedding-3-*)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub dimensions: Option<usize>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct EmbeddingResponse {
        pub data: Vec<EmbeddingData>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct EmbeddingData {
        pub embedding: Vec<f32>,
        pub index: usize,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    impl OpenAiEmbedder {
        /// Create a new embedding client
        pub fn new(config: EmbeddingConfig) -> IndexResult<Self> {
            let api_key = config.get_api_key()?;
            if config.batch_size == 0 {
                return Err(IndexError::Configuration(
                    "embedding batch_size must be greater than 0".to_string(),
                ));
            }

            let client = Client::builder().timeout(config.timeout()).build()?;

            Ok(Self {
                config,
                client,
                api_key,
            })
        }

        pub fn model(&self) -> &str {
            &self.config.model
        }

        async fn embed_batch(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
            let url = format!("{}/embeddings", self.config.api_base.trim_end_matches('/'));

            // Only send dimensions for OpenAI text-embedding-3 models
            let dimensions = self
                .config
                .model
                .starts_with("text-embedding-3")
                .then_some(self.config.dimensions);

            let request = EmbeddingRequest {
                model: &self.config.model,
                input: texts,
                dimensions,
            };

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;

            if !status.is_success() {
                let message = serde_json::from_str::<ErrorResponse>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or_else(|_| format!("API error ({status}): {body}"));
                return Err(classify_status(status, message));
            }

            let response: EmbeddingResponse = serde_json::from_str(&body)?;
            collect_ordered(response, texts.len())
        }
    }

    pub(super) fn classify_status(status: StatusCode, message: String) -> IndexError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            IndexError::EmbeddingUnavailable(message)
        } else {
            IndexError::Embedding(message)
        }
    }

    pub(super) fn collect_ordered(
        response: EmbeddingResponse,
        expected: usize,
    ) -> IndexResult<Vec<Vec<f32>>> {
        if response.data.len() != expected {
            return Err(IndexError::Embedding(format!(
                "Embedding count mismatch: sent {} texts, got {} embeddings",
                expected,
                response.data.len()
            )));
        }

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    #[async_trait]
    impl Embedder for OpenAiEmbedder {
        async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
            let mut all_embeddings = Vec::with_capacity(texts.len());
            for batch in texts.chunks(self.config.batch_size) {
                all_embeddings.extend(self.embed_batch(batch).await?);
            }
            Ok(all_embeddings)
        }

        fn dimensions(&self) -> usize {
            self.config.dimensions
        }

        fn name(&self) -> &str {
            &self.config.model
        }
    }
}
