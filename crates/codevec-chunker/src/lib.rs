//! Source chunking for vector indexing.
//!
//! Three strategies share one position model (1-indexed rows, 0-indexed columns):
//! a flat sliding window over a string, the same window translated onto file
//! lines, and a tree-sitter walk that keeps syntax units together and falls
//! back to the line window when no grammar is available.

pub mod chunk;
pub mod error;
pub mod filter;
pub mod languages;
pub mod text;
pub mod tree;

pub use chunk::{Chunk, ChunkerConfig, Position};
pub use error::{ChunkerError, Result};
pub use filter::ChunkFilter;
pub use languages::{Lang, detect_language};
pub use text::{FileChunker, StringChunker};
pub use tree::TreeSitterChunker;
