#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("overlap ratio must be within [0, 1), got {0}")]
    InvalidOverlap(f64),

    #[error("chunk size must not be zero")]
    ZeroChunkSize,

    #[error("invalid chunk filter for `{language}`: {source}")]
    InvalidFilter {
        language: String,
        #[source]
        source: regex::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path} is not valid UTF-8 text")]
    Decode { path: String },
}

pub type Result<T> = std::result::Result<T, ChunkerError>;
