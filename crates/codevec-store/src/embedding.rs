//! Embedding functions resolved by name.
//!
//! `hashing` is a deterministic local embedder that needs no model server and is
//! the fallback whenever a configured name cannot be resolved.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_EMBEDDING: &str = "hashing";

pub trait EmbeddingFunction: Send + Sync {
    /// Name recorded in collection metadata.
    fn name(&self) -> &str;

    /// Embed every text, preserving order.
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>;
}

/// Parameters for the named embedding functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingParams {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Output size of the `hashing` embedder.
    #[serde(default)]
    pub dimensions: Option<usize>,
}

/// Resolve an embedding function by name, falling back to `hashing` with a
/// warning when the name is unknown or its parameters are incomplete.
#[must_use]
pub fn resolve_embedding(name: &str, params: &EmbeddingParams) -> Arc<dyn EmbeddingFunction> {
    match try_resolve(name, params) {
        Some(function) => function,
        None => {
            tracing::warn!(
                requested = name,
                fallback = DEFAULT_EMBEDDING,
                "embedding function unavailable, using fallback"
            );
            Arc::new(HashingEmbedding::new(
                params.dimensions.unwrap_or(HashingEmbedding::DEFAULT_DIMENSIONS),
            ))
        }
    }
}

fn try_resolve(name: &str, params: &EmbeddingParams) -> Option<Arc<dyn EmbeddingFunction>> {
    match name {
        "hashing" => Some(Arc::new(HashingEmbedding::new(
            params.dimensions.unwrap_or(HashingEmbedding::DEFAULT_DIMENSIONS),
        ))),
        "ollama" => Some(Arc::new(OllamaEmbedding::new(
            params
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".into()),
            params
                .model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".into()),
        ))),
        "openai" => {
            let api_key = params
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())?;
            Some(Arc::new(OpenAiEmbedding::new(
                api_key,
                params
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".into()),
                params
                    .model
                    .clone()
                    .unwrap_or_else(|| "text-embedding-3-small".into()),
            )))
        }
        _ => None,
    }
}

/// Shared HTTP client: 30s connect timeout, 120s request timeout.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(120))
        .user_agent(concat!("codevec/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Feature-hashing bag of identifier tokens.
///
/// Tokens are split on non-alphanumerics and on `camelCase` humps, lowercased,
/// hashed with blake3 into a signed bucket, and the vector is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimensions: usize,
}

impl HashingEmbedding {
    pub const DEFAULT_DIMENSIONS: usize = 256;

    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    #[must_use]
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokens(text) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[..8]);
            let value = u64::from_le_bytes(word);
            let bucket = usize::try_from(value % self.dimensions as u64).unwrap_or(0);
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedding {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let mut current = String::new();
        let mut prev_lower = false;
        for c in word.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.extend(c.to_lowercase());
        }
        if !current.is_empty() {
            out.push(current);
        }
    }
    out
}

impl EmbeddingFunction for HashingEmbedding {
    fn name(&self) -> &str {
        "hashing"
    }

    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
        Box::pin(async move { Ok(texts.iter().map(|t| self.embed_one(t)).collect()) })
    }
}

/// Ollama `/api/embed`.
#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedding {
    #[must_use]
    pub fn new(mut base_url: String, model: String) -> Self {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: http_client(),
            base_url,
            model,
        }
    }
}

impl EmbeddingFunction for OllamaEmbedding {
    fn name(&self) -> &str {
        "ollama"
    }

    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/api/embed", self.base_url))
                .json(&OllamaRequest {
                    model: &self.model,
                    input: texts,
                })
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(StoreError::Embedding(format!(
                    "ollama returned {status}: {body}"
                )));
            }
            let parsed: OllamaResponse = response.json().await?;
            check_count(parsed.embeddings, texts.len())
        })
    }
}

/// OpenAI-compatible `/embeddings`.
#[derive(Clone)]
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for OpenAiEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedding")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

impl OpenAiEmbedding {
    #[must_use]
    pub fn new(api_key: String, mut base_url: String, model: String) -> Self {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: http_client(),
            api_key,
            base_url,
            model,
        }
    }
}

impl EmbeddingFunction for OpenAiEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&OpenAiRequest {
                    model: &self.model,
                    input: texts,
                })
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::error!("OpenAI embedding API error {status}: {body}");
                return Err(StoreError::Embedding(format!(
                    "openai embedding request failed (status {status})"
                )));
            }
            let mut parsed: OpenAiResponse = response.json().await?;
            parsed.data.sort_by_key(|d| d.index);
            check_count(
                parsed.data.into_iter().map(|d| d.embedding).collect(),
                texts.len(),
            )
        })
    }
}

fn check_count(embeddings: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if embeddings.len() == expected {
        Ok(embeddings)
    } else {
        Err(StoreError::Embedding(format!(
            "expected {expected} embeddings, got {}",
            embeddings.len()
        )))
    }
}

/// Cut each vector down to `dims` when configured.
pub fn truncate_embeddings(embeddings: &mut [Vec<f32>], dims: Option<usize>) {
    let Some(dims) = dims else {
        return;
    };
    for vector in embeddings {
        vector.truncate(dims);
    }
}
