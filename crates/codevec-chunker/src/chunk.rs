use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChunkerError, Result};

/// Location inside a source text. Rows are 1-indexed, columns 0-indexed and
/// counted in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub row: usize,
    pub column: usize,
}

impl Position {
    #[must_use]
    pub const fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }
}

/// A bounded fragment of a file or query string.
///
/// `start`/`end` are absent when the origin line range is unknown, e.g. for
/// chunks read back from a store that never recorded positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Chunk {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            start: None,
            end: None,
            path: None,
            id: None,
        }
    }

    #[must_use]
    pub fn with_span(text: impl Into<String>, start: Position, end: Position) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::new(text)
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Whether the chunk carries a line range.
    #[must_use]
    pub fn has_span(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn default_chunk_size() -> i32 {
    2500
}

fn default_overlap_ratio() -> f64 {
    0.2
}

/// Chunker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Window size in characters. Negative disables splitting.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i32,
    /// Fraction of a window shared with the next one, in `[0, 1)`.
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f64,
    /// Regex filters keyed by language id, or `"*"` for every language.
    #[serde(default)]
    pub chunk_filters: HashMap<String, Vec<String>>,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap_ratio: default_overlap_ratio(),
            chunk_filters: HashMap::new(),
        }
    }
}

impl ChunkerConfig {
    #[must_use]
    pub fn new(chunk_size: i32, overlap_ratio: f64) -> Self {
        Self {
            chunk_size,
            overlap_ratio,
            chunk_filters: HashMap::new(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the overlap ratio is outside `[0, 1)` or the chunk size is zero.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.overlap_ratio) {
            return Err(ChunkerError::InvalidOverlap(self.overlap_ratio));
        }
        if self.chunk_size == 0 {
            return Err(ChunkerError::ZeroChunkSize);
        }
        Ok(())
    }

    /// Window size and step in characters, or `None` when splitting is disabled.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn window(&self) -> Option<(usize, usize)> {
        let size = usize::try_from(self.chunk_size).ok()?;
        let step = ((size as f64) * (1.0 - self.overlap_ratio)) as usize;
        Some((size, step.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ChunkerConfig::default();
        assert_eq!(config.chunk_size, 2500);
        assert!(config.validate().is_ok());
        assert_eq!(config.window(), Some((2500, 2000)));
    }

    #[test]
    fn overlap_out_of_range_rejected() {
        assert!(matches!(
            ChunkerConfig::new(10, 1.0).validate(),
            Err(ChunkerError::InvalidOverlap(_))
        ));
        assert!(matches!(
            ChunkerConfig::new(10, -0.1).validate(),
            Err(ChunkerError::InvalidOverlap(_))
        ));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(matches!(
            ChunkerConfig::new(0, 0.0).validate(),
            Err(ChunkerError::ZeroChunkSize)
        ));
    }

    #[test]
    fn negative_chunk_size_disables_window() {
        let config = ChunkerConfig::new(-1, 0.5);
        assert!(config.validate().is_ok());
        assert_eq!(config.window(), None);
    }

    #[test]
    fn step_never_below_one() {
        assert_eq!(ChunkerConfig::new(5, 0.8).window(), Some((5, 1)));
        assert_eq!(ChunkerConfig::new(1, 0.99).window(), Some((1, 1)));
        assert_eq!(ChunkerConfig::new(5, 0.5).window(), Some((5, 2)));
    }

    #[test]
    fn chunk_displays_its_text() {
        let chunk = Chunk::with_span("abc", Position::new(1, 0), Position::new(1, 2));
        assert_eq!(chunk.to_string(), "abc");
        assert!(chunk.has_span());
        assert!(!Chunk::new("abc").has_span());
    }
}
