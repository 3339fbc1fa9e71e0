use codevec_chunker::ChunkerError;
use codevec_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("invalid path spec: {0}")]
    Spec(#[from] ignore::Error),

    #[error("rerank failed: {0}")]
    Rerank(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
