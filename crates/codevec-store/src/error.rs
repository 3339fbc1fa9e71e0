use codevec_chunker::ChunkerError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no collection exists for {path}")]
    CollectionNotFound { path: String },

    #[error(
        "collection metadata field `{field}` mismatch (expected {expected}, found {actual}); \
         this is likely a collection id collision"
    )]
    MetadataMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("collection was embedded with `{stored}` but `{configured}` is configured")]
    EmbeddingMismatch { stored: String, configured: String },

    #[error("bundled server at {url} did not answer within {secs}s")]
    ServerTimeout { url: String, secs: u64 },

    #[error("failed to spawn bundled server: {0}")]
    Spawn(String),

    #[error("unknown backend `{0}`")]
    UnknownBackend(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunking failed: {0}")]
    Chunker(#[from] ChunkerError),

    #[error("result merge failed: {0}")]
    Merge(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
