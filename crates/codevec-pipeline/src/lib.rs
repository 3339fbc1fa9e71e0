//! Indexing and query pipelines on top of a [`codevec_store::StoreConnector`].
//!
//! Indexing expands paths, filters them through gitignore-style specs, skips
//! unchanged files by hash and vectorises the rest on a bounded worker pool.
//! Querying chunks the query strings, searches, reranks and resolves the
//! winning identifiers back to documents or line ranges.

pub mod error;
pub mod files;
pub mod indexer;
pub mod query;
pub mod rerank;

pub use error::{PipelineError, Result};
pub use files::{PathSpec, SpecFiles, expand_paths};
pub use indexer::Indexer;
pub use query::{QueryConfig, QueryInclude, QueryOutput, query, render_text};
pub use rerank::{
    CrossEncoderReranker, HttpRelevanceScorer, NaiveReranker, RelevanceScorer, Reranker,
    RerankerParams, resolve_reranker,
};
