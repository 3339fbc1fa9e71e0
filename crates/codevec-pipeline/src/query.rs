//! Query pipeline: search, rerank and resolve identifiers into output records.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use codevec_chunker::{ChunkerConfig, StringChunker};
use codevec_store::{
    QueryOptions, QueryResult, ResultType, StoreConnector, count, verify_embedding_function,
};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::files::expand_paths;
use crate::rerank::Reranker;

/// Fields a query result may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryInclude {
    Path,
    Document,
    Chunk,
}

impl QueryInclude {
    #[must_use]
    pub fn header(self) -> &'static str {
        match self {
            Self::Path => "Path: ",
            Self::Document => "Document:\n",
            Self::Chunk => "Chunk: ",
        }
    }
}

impl std::str::FromStr for QueryInclude {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "path" => Ok(Self::Path),
            "document" => Ok(Self::Document),
            "chunk" => Ok(Self::Chunk),
            other => Err(PipelineError::Config(format!("unknown include field `{other}`"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub queries: Vec<String>,
    pub n_result: usize,
    pub include: Vec<QueryInclude>,
    /// Files left out of the search.
    pub exclude: Vec<PathBuf>,
    /// Widen the candidate pool to `n_result * query_multiplier` in document
    /// mode; non-positive means the whole collection.
    pub query_multiplier: i32,
    pub use_absolute_path: bool,
    pub project_root: PathBuf,
    /// Chunker applied to the query strings.
    pub chunker: ChunkerConfig,
}

impl QueryConfig {
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>, queries: Vec<String>) -> Self {
        Self {
            queries,
            n_result: 1,
            include: vec![QueryInclude::Path, QueryInclude::Document],
            exclude: Vec::new(),
            query_multiplier: -1,
            use_absolute_path: false,
            project_root: project_root.into(),
            chunker: ChunkerConfig::default(),
        }
    }

    fn result_type(&self) -> ResultType {
        if self.include.contains(&QueryInclude::Chunk) {
            ResultType::Chunk
        } else {
            ResultType::Document
        }
    }
}

/// One resolved query result; only requested fields are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
}

impl QueryOutput {
    fn field(&self, include: QueryInclude) -> Option<&str> {
        match include {
            QueryInclude::Path => self.path.as_deref(),
            QueryInclude::Document => self.document.as_deref(),
            QueryInclude::Chunk => self.chunk.as_deref(),
        }
    }
}

/// Run a query against the connector's collection.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] when both `chunk` and `document` are
/// requested, and propagates store errors such as a missing collection or an
/// embedding-function mismatch.
pub async fn query(
    connector: &dyn StoreConnector,
    reranker: &dyn Reranker,
    config: &QueryConfig,
) -> Result<Vec<QueryOutput>> {
    let mut config = config.clone();
    if config.include.contains(&QueryInclude::Chunk) && config.include.contains(&QueryInclude::Document) {
        return Err(PipelineError::Config(
            "`chunk` and `document` cannot be included together".into(),
        ));
    }
    verify_embedding_function(connector).await?;

    let chunker = StringChunker::new(config.chunker.clone())?;
    let query_chunks: Vec<String> = config
        .queries
        .iter()
        .flat_map(|q| chunker.chunk(q).map(|c| c.text).collect::<Vec<_>>())
        .collect();
    if query_chunks.is_empty() {
        return Ok(Vec::new());
    }

    let collection_size = count(connector, ResultType::Chunk).await?;
    if collection_size == 0 {
        return Ok(Vec::new());
    }
    if config.result_type() == ResultType::Chunk && !connector.has_line_ranges().await? {
        tracing::warn!(
            "collection has no line range metadata; falling back to path and document, re-vectorise to use chunk output"
        );
        config.include = vec![QueryInclude::Path, QueryInclude::Document];
    }
    let by = config.result_type();

    let candidates = match by {
        ResultType::Chunk => config.n_result,
        ResultType::Document => match usize::try_from(config.query_multiplier) {
            Ok(m) if m > 0 => config.n_result.saturating_mul(m).min(collection_size),
            _ => collection_size,
        },
    };

    let options = QueryOptions {
        keywords: query_chunks.clone(),
        count: Some(candidates),
        exclude: excluded_paths(&config)?,
        chunk_only: by == ResultType::Chunk,
    };
    let results = connector.query(&options).await?;
    tracing::debug!(candidates = results.len(), by = ?by, "search finished");

    let ranked = reranker
        .rerank(&query_chunks, &results, by, config.n_result)
        .await?;
    tracing::info!(reranker = reranker.name(), results = ranked.len(), "query finished");

    Ok(match by {
        ResultType::Document => resolve_documents(&config, &ranked).await,
        ResultType::Chunk => resolve_chunks(&config, &ranked, &results).await,
    })
}

/// Existing files named by `exclude`, globs expanded, as stored paths.
fn excluded_paths(config: &QueryConfig) -> Result<Vec<String>> {
    if config.exclude.is_empty() {
        return Ok(Vec::new());
    }
    let base = std::env::current_dir().unwrap_or_else(|_| config.project_root.clone());
    let inputs: Vec<String> = config
        .exclude
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    Ok(expand_paths(&inputs, &base, true, true)?
        .into_iter()
        .map(|p| {
            std::path::absolute(&p)
                .unwrap_or(p)
                .to_string_lossy()
                .into_owned()
        })
        .collect())
}

fn display_path(config: &QueryConfig, path: &str) -> String {
    if config.use_absolute_path {
        return path.to_owned();
    }
    Path::new(path)
        .strip_prefix(&config.project_root)
        .map_or_else(|_| path.to_owned(), |p| p.to_string_lossy().into_owned())
}

async fn resolve_documents(config: &QueryConfig, ranked: &[String]) -> Vec<QueryOutput> {
    let mut outputs = Vec::with_capacity(ranked.len());
    for path in ranked {
        let document = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path, "{e}; re-vectorise to refresh the collection");
                continue;
            }
        };
        outputs.push(QueryOutput {
            path: config
                .include
                .contains(&QueryInclude::Path)
                .then(|| display_path(config, path)),
            document: config.include.contains(&QueryInclude::Document).then_some(document),
            ..QueryOutput::default()
        });
    }
    outputs
}

/// Lines `start..=end` (1-indexed) of `text`, line endings kept.
fn line_range(text: &str, start: usize, end: usize) -> String {
    text.split_inclusive('\n')
        .skip(start.saturating_sub(1))
        .take(end.saturating_sub(start.max(1)) + 1)
        .collect()
}

async fn resolve_chunks(
    config: &QueryConfig,
    ranked: &[String],
    results: &[QueryResult],
) -> Vec<QueryOutput> {
    let by_id: HashMap<&str, &QueryResult> = results
        .iter()
        .filter_map(|r| Some((r.chunk.id.as_deref()?, r)))
        .collect();

    let mut outputs = Vec::with_capacity(ranked.len());
    for id in ranked {
        let Some(result) = by_id.get(id.as_str()) else {
            continue;
        };
        let (Some(start), Some(end)) = (result.chunk.start, result.chunk.end) else {
            tracing::warn!(chunk = %id, "chunk has no line range; skipping");
            continue;
        };
        let text = match tokio::fs::read_to_string(&result.path).await {
            Ok(source) => line_range(&source, start.row, end.row),
            Err(e) => {
                tracing::warn!(path = %result.path, "{e}; using stored chunk text");
                result.chunk.text.clone()
            }
        };
        outputs.push(QueryOutput {
            path: config
                .include
                .contains(&QueryInclude::Path)
                .then(|| display_path(config, &result.path)),
            chunk: Some(text),
            start_line: Some(start.row),
            end_line: Some(end.row),
            ..QueryOutput::default()
        });
    }
    outputs
}

/// Human-readable rendering: one header per field, blank line between results.
///
/// Fields follow `include` order; fields set but not requested (after a
/// chunk-mode fallback) come last.
#[must_use]
pub fn render_text(outputs: &[QueryOutput], include: &[QueryInclude]) -> String {
    let mut order: Vec<QueryInclude> = Vec::with_capacity(3);
    for field in include
        .iter()
        .copied()
        .chain([QueryInclude::Path, QueryInclude::Document, QueryInclude::Chunk])
    {
        if !order.contains(&field) {
            order.push(field);
        }
    }

    let mut out = String::new();
    for (i, output) in outputs.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for field in &order {
            if let Some(value) = output.field(*field) {
                let _ = writeln!(out, "{}{value}", field.header());
            }
        }
    }
    out
}
