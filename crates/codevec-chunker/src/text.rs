//! Fixed-size sliding-window chunkers.

use std::path::Path;

use crate::chunk::{Chunk, ChunkerConfig, Position};
use crate::error::{ChunkerError, Result};

/// Character windows over a text: `(start_char, end_char_exclusive, slice)`.
///
/// Stops after the first window that reaches the end of the input, so it never
/// overshoots and always terminates since `step >= 1`.
struct Windows<'a> {
    text: &'a str,
    /// Byte offset of every char, followed by `text.len()`.
    byte_offsets: Vec<usize>,
    size: usize,
    step: usize,
    next: Option<usize>,
}

impl<'a> Windows<'a> {
    fn new(text: &'a str, size: usize, step: usize) -> Self {
        let mut byte_offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        byte_offsets.push(text.len());
        Self {
            text,
            byte_offsets,
            size,
            step,
            next: Some(0),
        }
    }

    fn char_len(&self) -> usize {
        self.byte_offsets.len() - 1
    }
}

impl<'a> Iterator for Windows<'a> {
    type Item = (usize, usize, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next?;
        let total = self.char_len();
        if start >= total {
            self.next = None;
            return None;
        }
        let end = (start + self.size).min(total);
        self.next = if start + self.size >= total {
            None
        } else {
            Some(start + self.step)
        };
        let slice = &self.text[self.byte_offsets[start]..self.byte_offsets[end]];
        Some((start, end, slice))
    }
}

/// Line boundaries of a text, in characters.
///
/// Lines keep their trailing newline, matching how the file is read.
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Char offset of each line start, followed by the total char count.
    offsets: Vec<usize>,
}

impl LineIndex {
    #[must_use]
    pub fn new(text: &str) -> Self {
        let mut offsets = vec![0];
        let mut total = 0;
        for (i, c) in text.chars().enumerate() {
            if c == '\n' {
                offsets.push(i + 1);
            }
            total = i + 1;
        }
        if offsets.last() != Some(&total) {
            offsets.push(total);
        }
        Self { offsets }
    }

    /// Number of lines; a trailing newline does not open an extra line.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Position of the char at flat offset `index`.
    #[must_use]
    pub fn start_position(&self, index: usize) -> Position {
        let line = self.offsets.partition_point(|&o| o <= index).saturating_sub(1);
        Position::new(line + 1, index - self.offsets[line])
    }

    /// Position of the last char of a span ending (exclusively) at `end`.
    #[must_use]
    pub fn end_position(&self, end: usize) -> Position {
        let line = self.offsets.partition_point(|&o| o < end).saturating_sub(1);
        Position::new(line + 1, (end - self.offsets[line]).saturating_sub(1))
    }
}

/// Splits a string into overlapping windows with flat row-1 positions.
///
/// Used for query strings, whose line structure is irrelevant.
#[derive(Debug, Clone)]
pub struct StringChunker {
    config: ChunkerConfig,
}

impl StringChunker {
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    pub fn chunk<'a>(&self, text: &'a str) -> Box<dyn Iterator<Item = Chunk> + 'a> {
        if text.is_empty() {
            return Box::new(std::iter::empty());
        }
        let Some((size, step)) = self.config.window() else {
            let len = text.chars().count();
            return Box::new(std::iter::once(Chunk::with_span(
                text,
                Position::new(1, 0),
                Position::new(1, len),
            )));
        };
        Box::new(Windows::new(text, size, step).map(|(start, end, slice)| {
            Chunk::with_span(
                slice,
                Position::new(1, start),
                Position::new(1, (end - 1).max(start)),
            )
        }))
    }
}

/// Same windows as [`StringChunker`], with positions translated onto file lines.
#[derive(Debug, Clone)]
pub struct FileChunker {
    config: ChunkerConfig,
}

impl FileChunker {
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Chunk already-loaded file content.
    pub fn chunk<'a>(&self, content: &'a str) -> Box<dyn Iterator<Item = Chunk> + 'a> {
        if content.is_empty() {
            return Box::new(std::iter::empty());
        }
        let lines = LineIndex::new(content);
        let Some((size, step)) = self.config.window() else {
            let total = content.chars().count();
            return Box::new(std::iter::once(Chunk::with_span(
                content,
                Position::new(1, 0),
                lines.end_position(total),
            )));
        };
        Box::new(
            Windows::new(content, size, step).map(move |(start, end, slice)| {
                Chunk::with_span(slice, lines.start_position(start), lines.end_position(end))
            }),
        )
    }

    /// Read and chunk a file, tagging each chunk with its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not UTF-8.
    pub fn chunk_path(&self, path: &Path) -> Result<Vec<Chunk>> {
        let content = read_text(path)?;
        let display = path.display().to_string();
        Ok(self
            .chunk(&content)
            .map(|c| c.with_path(display.clone()))
            .collect())
    }
}

/// Read a file as UTF-8, separating decode failures from I/O failures.
///
/// # Errors
///
/// Returns [`ChunkerError::Decode`] for non-text content.
pub fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    String::from_utf8(bytes).map_err(|_| ChunkerError::Decode {
        path: path.display().to_string(),
    })
}
