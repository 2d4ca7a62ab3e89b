//! Embeddings from an OpenAI-compatible `/embeddings` endpoint.
//!
//! Only built with the `openai` feature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

const PROVIDER: &str = "OpenAI";

/// An [`EmbeddingProvider`] calling `{base_url}/embeddings`.
///
/// Defaults to `text-embedding-3-small` at 1536 dimensions on
/// `https://api.openai.com/v1`. Setting a dimension asks the API to truncate
/// (Matryoshka), which changes the index signature.
///
/// ```rust,ignore
/// let provider = OpenAIEmbeddingProvider::from_env()?.with_dimensions(256);
/// ```
pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
    truncate: bool,
}

impl OpenAIEmbeddingProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(RagError::embedding(PROVIDER, None, "API key must not be empty"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".into(),
            model: "text-embedding-3-small".into(),
            dimensions: 1536,
            truncate: false,
        })
    }

    /// Read the key from `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::embedding(PROVIDER, None, "OPENAI_API_KEY is not set"))?;
        Self::new(key)
    }

    /// Use another model. Pair with [`with_dimensions`](Self::with_dimensions)
    /// unless it also produces 1536-dimensional vectors.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self.truncate = true;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn fail(&self, index: Option<usize>, message: impl Into<String>) -> RagError {
        let error = RagError::embedding(PROVIDER, index, message);
        error!(provider = PROVIDER, model = %self.model, error = %error, "embedding request failed");
        error
    }
}

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply {
    Data { data: Vec<Item> },
    Error { error: ApiError },
}

#[derive(Deserialize)]
struct Item {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        // The API rejects the whole request for one empty string without saying which.
        if let Some(i) = texts.iter().position(|t| t.is_empty()) {
            return Err(RagError::embedding(PROVIDER, Some(i), "input must not be empty"));
        }

        debug!(provider = PROVIDER, model = %self.model, inputs = texts.len(), "embedding batch");
        let request = Request {
            model: &self.model,
            input: texts,
            dimensions: self.truncate.then_some(self.dimensions),
        };
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.fail(None, format!("request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.fail(None, format!("read failed: {e}")))?;
        let data = match serde_json::from_str::<Reply>(&body) {
            Ok(Reply::Data { data }) if status.is_success() => data,
            Ok(Reply::Error { error }) => {
                return Err(self.fail(None, format!("API returned {status}: {}", error.message)));
            }
            _ => return Err(self.fail(None, format!("API returned {status}: {body}"))),
        };

        place_by_index(data, texts.len()).map_err(|missing| {
            self.fail(Some(missing), "response has no embedding for this input")
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Order items by their `index` field; `Err` names the first input left
/// without a vector.
fn place_by_index(items: Vec<Item>, len: usize) -> std::result::Result<Vec<Vec<f32>>, usize> {
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; len];
    for item in items {
        if let Some(slot) = slots.get_mut(item.index) {
            *slot = Some(item.embedding);
        }
    }
    slots.into_iter().enumerate().map(|(i, slot)| slot.ok_or(i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: usize, value: f32) -> Item {
        Item { index, embedding: vec![value] }
    }

    #[test]
    fn blank_api_key_is_rejected() {
        assert!(OpenAIEmbeddingProvider::new("  ").is_err());
    }

    #[test]
    fn dimensions_override_is_reported() {
        let provider = OpenAIEmbeddingProvider::new("sk-test")
            .unwrap()
            .with_model("text-embedding-3-large")
            .with_dimensions(256)
            .with_base_url("http://localhost:8080/v1/");
        assert_eq!(provider.signature().to_string(), "text-embedding-3-large/256");
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
    }

    #[tokio::test]
    async fn empty_input_is_rejected_with_its_position() {
        let provider = OpenAIEmbeddingProvider::new("sk-test").unwrap();
        let err = provider.embed_batch(&["fine", ""]).await.unwrap_err();
        assert!(matches!(err, RagError::Embedding { index: Some(1), .. }));
    }

    #[test]
    fn items_are_placed_by_index() {
        let placed = place_by_index(vec![item(1, 1.0), item(0, 0.0)], 2).unwrap();
        assert_eq!(placed, vec![vec![0.0], vec![1.0]]);
        assert_eq!(place_by_index(vec![item(0, 0.0), item(2, 2.0)], 3), Err(1));
    }

    #[test]
    fn error_reply_parses() {
        let reply: Reply = serde_json::from_str(r#"{"error":{"message":"bad key"}}"#).unwrap();
        assert!(matches!(reply, Reply::Error { error } if error.message == "bad key"));
    }
}
