use std::sync::Arc;
use std::time::Duration;

use codevec_store::{QueryResult, ResultType};
use serde::{Deserialize, Serialize};

use super::{BoxFuture, Reranker, rank_groups};
use crate::error::{PipelineError, Result};

/// Scores the relevance of candidate texts against one query.
pub trait RelevanceScorer: Send + Sync {
    /// Raw (unnormalised) relevance scores, one per text, in input order.
    fn score<'a>(&'a self, query: &'a str, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<f32>>>;
}

/// A cross-encoder served behind a `POST {url}/rerank` endpoint
/// (text-embeddings-inference style).
#[derive(Debug, Clone)]
pub struct HttpRelevanceScorer {
    client: reqwest::Client,
    base_url: String,
    model: Option<String>,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct RerankHit {
    index: usize,
    score: f32,
}

impl HttpRelevanceScorer {
    #[must_use]
    pub fn new(base_url: &str, model: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("codevec/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            model,
        }
    }
}

impl RelevanceScorer for HttpRelevanceScorer {
    fn score<'a>(&'a self, query: &'a str, texts: &'a [String]) -> BoxFuture<'a, Result<Vec<f32>>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/rerank", self.base_url))
                .json(&RerankRequest {
                    query,
                    texts,
                    raw_scores: true,
                    model: self.model.as_deref(),
                })
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PipelineError::Rerank(format!("scorer returned {status}: {body}")));
            }
            let hits: Vec<RerankHit> = response.json().await?;
            let mut scores = vec![None; texts.len()];
            for hit in hits {
                let Some(slot) = scores.get_mut(hit.index) else {
                    return Err(PipelineError::Rerank(format!(
                        "scorer returned index {} for {} texts",
                        hit.index,
                        texts.len()
                    )));
                };
                *slot = Some(hit.score);
            }
            scores
                .into_iter()
                .collect::<Option<Vec<f32>>>()
                .ok_or_else(|| PipelineError::Rerank("scorer skipped some texts".into()))
        })
    }
}

/// Rescores every candidate against each query chunk with a cross-encoder.
///
/// Scores are softmax-normalised per query chunk, so they are comparable
/// across chunks before the per-group mean is taken.
#[derive(Clone)]
pub struct CrossEncoderReranker {
    scorer: Arc<dyn RelevanceScorer>,
    top_k: Option<usize>,
}

impl std::fmt::Debug for CrossEncoderReranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossEncoderReranker")
            .field("top_k", &self.top_k)
            .finish_non_exhaustive()
    }
}

impl CrossEncoderReranker {
    #[must_use]
    pub fn new(scorer: Arc<dyn RelevanceScorer>, top_k: Option<usize>) -> Self {
        Self { scorer, top_k }
    }
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        "crossencoder"
    }

    fn rerank<'a>(
        &'a self,
        query_chunks: &'a [String],
        results: &'a [QueryResult],
        by: ResultType,
        n_result: usize,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            if results.is_empty() || query_chunks.is_empty() {
                return Ok(Vec::new());
            }
            let mut scored = Vec::with_capacity(results.len());
            for query in query_chunks {
                let own: Vec<&QueryResult> =
                    results.iter().filter(|r| r.queries.contains(query)).collect();
                if own.is_empty() {
                    continue;
                }
                let texts: Vec<String> = own.iter().map(|r| r.chunk.text.clone()).collect();
                let raw = self.scorer.score(query, &texts).await?;
                if raw.len() != texts.len() {
                    return Err(PipelineError::Rerank(format!(
                        "expected {} scores, got {}",
                        texts.len(),
                        raw.len()
                    )));
                }
                for (result, score) in own.into_iter().zip(softmax(&raw)) {
                    scored.push(QueryResult::new(
                        result.path.clone(),
                        result.chunk.clone(),
                        query.clone(),
                        score,
                    ));
                }
            }
            tracing::debug!(candidates = results.len(), queries = query_chunks.len(), "cross-encoder scored");
            Ok(rank_groups(scored, by, self.top_k, n_result))
        })
    }
}
