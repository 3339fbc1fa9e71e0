//! Rerankers turn raw per-chunk hits into a ranked list of identifiers.
//!
//! An identifier is a chunk id for chunk-level output and a file path
//! otherwise. Each group keeps its `top_k` best scores; `top_k` defaults to
//! the truncated mean group size. Groups are ranked by the mean of the kept
//! scores, ties keeping first-seen order.

mod cross_encoder;
mod naive;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use codevec_store::types::group_results;
use codevec_store::{QueryResult, ResultType};
use serde::{Deserialize, Serialize};

pub use self::cross_encoder::{CrossEncoderReranker, HttpRelevanceScorer, RelevanceScorer};
pub use self::naive::NaiveReranker;
use crate::error::{PipelineError, Result};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Rank identifiers of `results`, best first, at most `n_result` of them.
    /// `query_chunks` are the chunked query strings the results were searched with.
    fn rerank<'a>(
        &'a self,
        query_chunks: &'a [String],
        results: &'a [QueryResult],
        by: ResultType,
        n_result: usize,
    ) -> BoxFuture<'a, Result<Vec<String>>>;
}

/// Reranker options from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankerParams {
    /// Results kept per group; `None` means the mean group size.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Base URL of a `/rerank` endpoint for the cross-encoder.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Resolve a reranker by name.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for unknown names or missing parameters.
pub fn resolve_reranker(name: &str, params: &RerankerParams) -> Result<Arc<dyn Reranker>> {
    match name {
        "naive" => Ok(Arc::new(NaiveReranker::new(params.top_k))),
        "crossencoder" | "cross-encoder" => {
            let url = params.url.clone().ok_or_else(|| {
                PipelineError::Config("the crossencoder reranker needs `reranker_params.url`".into())
            })?;
            let scorer = HttpRelevanceScorer::new(&url, params.model.clone());
            Ok(Arc::new(CrossEncoderReranker::new(Arc::new(scorer), params.top_k)))
        }
        other => Err(PipelineError::Config(format!("unknown reranker `{other}`"))),
    }
}

/// Group scored results (higher is better), keep `top_k` per group and rank
/// groups by mean kept score, descending and stable.
pub(crate) fn rank_groups(
    scored: Vec<QueryResult>,
    by: ResultType,
    top_k: Option<usize>,
    n_result: usize,
) -> Vec<String> {
    let mut groups: Vec<(String, f32)> = group_results(scored, by, top_k)
        .into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(key, members)| {
            let scores: Vec<f32> = members.iter().flat_map(|m| m.scores.iter().copied()).collect();
            (key, mean(&scores))
        })
        .collect();
    groups.sort_by(|a, b| b.1.total_cmp(&a.1));
    groups.into_iter().take(n_result).map(|(key, _)| key).collect()
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[cfg(test)]
mod tests {
    use codevec_chunker::Chunk;

    use super::*;

    pub(crate) fn hit(path: &str, id: &str, query: &str, distance: f32) -> QueryResult {
        QueryResult::new(
            path,
            Chunk::new(format!("text of {id}")).with_id(id).with_path(path),
            query,
            -distance,
        )
    }

    #[test]
    fn unknown_reranker_is_config_error() {
        let err = resolve_reranker("bm25", &RerankerParams::default()).err().unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn crossencoder_needs_url() {
        assert!(resolve_reranker("crossencoder", &RerankerParams::default()).is_err());
        let params = RerankerParams {
            url: Some("http://localhost:8080".into()),
            ..RerankerParams::default()
        };
        assert_eq!(resolve_reranker("crossencoder", &params).unwrap().name(), "crossencoder");
        assert_eq!(resolve_reranker("naive", &params).unwrap().name(), "naive");
    }

    #[test]
    fn zero_top_k_ranks_nothing() {
        let ranked = rank_groups(vec![hit("a", "1", "q", 0.1)], ResultType::Document, Some(0), 5);
        assert!(ranked.is_empty());
        assert!(rank_groups(Vec::new(), ResultType::Document, None, 5).is_empty());
    }
}
