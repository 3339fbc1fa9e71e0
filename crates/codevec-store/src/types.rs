use std::collections::HashMap;
use std::fmt::Write as _;
use std::ops::AddAssign;

use codevec_chunker::Chunk;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Granularity of stored content and of query identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Document,
    Chunk,
}

/// A file currently represented in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexedFile {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionContent {
    pub files: Vec<IndexedFile>,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub id: String,
    pub path: String,
    pub embedding_function: String,
    pub backend: String,
    pub file_count: usize,
    pub chunk_count: usize,
}

/// Parameters of a similarity search.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub keywords: Vec<String>,
    /// Results per keyword; `None` asks for the whole collection.
    pub count: Option<usize>,
    /// Absolute paths whose chunks are excluded.
    pub exclude: Vec<String>,
    /// Only return chunks that carry a line range.
    pub chunk_only: bool,
}

/// One stored chunk matched by one or more query strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub path: String,
    pub chunk: Chunk,
    pub queries: Vec<String>,
    pub scores: Vec<f32>,
}

impl QueryResult {
    #[must_use]
    pub fn new(path: impl Into<String>, chunk: Chunk, query: impl Into<String>, score: f32) -> Self {
        Self {
            path: path.into(),
            chunk,
            queries: vec![query.into()],
            scores: vec![score],
        }
    }

    /// Group key: chunk id for chunk-level output, else the source path.
    #[must_use]
    pub fn identifier(&self, by: ResultType) -> Option<&str> {
        match by {
            ResultType::Chunk => self.chunk.id.as_deref(),
            ResultType::Document => (!self.path.is_empty()).then_some(self.path.as_str()),
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_score(&self) -> f32 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<f32>() / self.scores.len() as f32
    }

    /// Concatenate queries and scores of results for the same chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if `results` is empty or refers to different chunks.
    pub fn merge(results: &[QueryResult]) -> Result<Self> {
        let Some(first) = results.first() else {
            return Err(StoreError::Merge("nothing to merge".into()));
        };
        let mut merged = first.clone();
        for other in &results[1..] {
            if other.path != first.path || other.chunk != first.chunk {
                return Err(StoreError::Merge(format!(
                    "cannot merge results of {} and {}",
                    first.path, other.path
                )));
            }
            merged.queries.extend(other.queries.iter().cloned());
            merged.scores.extend(other.scores.iter().copied());
        }
        Ok(merged)
    }
}

/// Group results by identifier, preserving first-seen order. Results without
/// an identifier are dropped.
///
/// With `top_k`, each group keeps only its `top_k` best-scoring results; `None`
/// uses the truncated mean group size.
#[must_use]
pub fn group_results(
    results: Vec<QueryResult>,
    by: ResultType,
    top_k: Option<usize>,
) -> Vec<(String, Vec<QueryResult>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<QueryResult>> = HashMap::new();
    for result in results {
        let Some(key) = result.identifier(by).map(str::to_owned) else {
            continue;
        };
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(result);
    }

    let k = top_k.unwrap_or_else(|| auto_top_k(groups.values().map(Vec::len)));
    order
        .into_iter()
        .filter_map(|key| {
            let mut members = groups.remove(&key)?;
            members.sort_by(|a, b| b.mean_score().total_cmp(&a.mean_score()));
            members.truncate(k);
            Some((key, members))
        })
        .collect()
}

/// Truncated mean of group sizes; zero for no groups.
#[must_use]
pub fn auto_top_k(sizes: impl Iterator<Item = usize>) -> usize {
    let (total, n) = sizes.fold((0usize, 0usize), |(t, n), s| (t + s, n + 1));
    if n == 0 { 0 } else { total / n }
}

/// Counters of one vectorisation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectoriseStats {
    pub add: usize,
    pub update: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl VectoriseStats {
    #[must_use]
    pub fn added() -> Self {
        Self {
            add: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn updated() -> Self {
        Self {
            update: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn skipped() -> Self {
        Self {
            skipped: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed() -> Self {
        Self {
            failed: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "add": self.add,
            "update": self.update,
            "removed": self.removed,
            "skipped": self.skipped,
            "failed": self.failed,
        })
    }

    #[must_use]
    pub fn to_table(&self) -> String {
        let rows = [
            ("Added", self.add),
            ("Updated", self.update),
            ("Removed", self.removed),
            ("Skipped", self.skipped),
            ("Failed", self.failed),
        ];
        let mut out = String::new();
        for (label, value) in rows {
            let _ = writeln!(out, "{label:<8} {value:>6}");
        }
        out
    }
}

impl AddAssign for VectoriseStats {
    fn add_assign(&mut self, rhs: Self) {
        self.add += rhs.add;
        self.update += rhs.update;
        self.removed += rhs.removed;
        self.skipped += rhs.skipped;
        self.failed += rhs.failed;
    }
}
