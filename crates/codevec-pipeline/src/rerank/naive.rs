use codevec_store::{QueryResult, ResultType};

use super::{BoxFuture, Reranker, rank_groups};
use crate::error::Result;

/// Ranks by mean distance of each group's closest hits.
///
/// Scores from the store are negated distances, so keeping the largest scores
/// keeps the smallest distances and ranking by descending mean score is
/// ranking by ascending mean distance.
#[derive(Debug, Clone, Default)]
pub struct NaiveReranker {
    top_k: Option<usize>,
}

impl NaiveReranker {
    #[must_use]
    pub fn new(top_k: Option<usize>) -> Self {
        Self { top_k }
    }

    #[must_use]
    pub fn rank(&self, results: &[QueryResult], by: ResultType, n_result: usize) -> Vec<String> {
        rank_groups(results.to_vec(), by, self.top_k, n_result)
    }
}

impl Reranker for NaiveReranker {
    fn name(&self) -> &str {
        "naive"
    }

    fn rerank<'a>(
        &'a self,
        _query_chunks: &'a [String],
        results: &'a [QueryResult],
        by: ResultType,
        n_result: usize,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move { Ok(self.rank(results, by, n_result)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rerank::tests::hit;

    #[test]
    fn groups_by_path_and_ranks_by_mean_distance() {
        let results = [
            hit("a.rs", "1", "q", 0.5),
            hit("b.rs", "2", "q", 0.1),
            hit("a.rs", "3", "q", 0.3),
            hit("b.rs", "4", "q", 0.2),
            hit("c.rs", "5", "q", 0.9),
            hit("c.rs", "6", "q", 0.05),
        ];
        // top_k = 2 keeps everything; means: a=0.4, b=0.15, c=0.475
        let ranked = NaiveReranker::new(None).rank(&results, ResultType::Document, 10);
        assert_eq!(ranked, ["b.rs", "a.rs", "c.rs"]);
    }

    #[test]
    fn top_k_keeps_smallest_distances() {
        let results = [
            hit("a.rs", "1", "q", 0.5),
            hit("a.rs", "2", "q", 0.01),
            hit("b.rs", "3", "q", 0.1),
        ];
        // a keeps only 0.01
        let ranked = NaiveReranker::new(Some(1)).rank(&results, ResultType::Document, 10);
        assert_eq!(ranked, ["a.rs", "b.rs"]);
    }

    #[test]
    fn chunk_mode_uses_chunk_ids() {
        let results = [hit("a.rs", "x", "q", 0.3), hit("a.rs", "y", "q", 0.1)];
        let ranked = NaiveReranker::new(None).rank(&results, ResultType::Chunk, 1);
        assert_eq!(ranked, ["y"]);
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let results = [
            hit("z.rs", "1", "q", 0.2),
            hit("a.rs", "2", "q", 0.2),
            hit("m.rs", "3", "q", 0.2),
        ];
        let ranked = NaiveReranker::new(None).rank(&results, ResultType::Document, 3);
        assert_eq!(ranked, ["z.rs", "a.rs", "m.rs"]);
    }

    mod proptest_ranking {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            #[test]
            fn ranking_is_ordered_by_kept_mean(
                hits in prop::collection::vec((0usize..6, 0u32..1000), 1..40),
                top_k in 1usize..4,
            ) {
                let results: Vec<QueryResult> = hits
                    .iter()
                    .enumerate()
                    .map(|(i, (g, d))| hit(&format!("f{g}"), &i.to_string(), "q", *d as f32 / 1000.0))
                    .collect();
                let ranked = NaiveReranker::new(Some(top_k)).rank(&results, ResultType::Document, 100);

                let kept_mean = |key: &str| {
                    let mut ds: Vec<f32> = results
                        .iter()
                        .filter(|r| r.path == key)
                        .map(|r| -r.scores[0])
                        .collect();
                    ds.sort_by(f32::total_cmp);
                    ds.truncate(top_k);
                    ds.iter().sum::<f32>() / ds.len() as f32
                };
                for pair in ranked.windows(2) {
                    prop_assert!(kept_mean(&pair[0]) <= kept_mean(&pair[1]) + 1e-6);
                }
                let groups: std::collections::HashSet<_> = results.iter().map(|r| r.path.clone()).collect();
                prop_assert_eq!(ranked.len(), groups.len());
            }
        }
    }
}
