//! Syntax-aware chunking via tree-sitter with greedy sibling merge.

use std::path::Path;

use tree_sitter::{Node, Parser, Tree};

use crate::chunk::{Chunk, ChunkerConfig, Position};
use crate::error::Result;
use crate::filter::ChunkFilter;
use crate::languages::{Lang, detect_language};
use crate::text::{FileChunker, read_text};

/// Chunks files along syntax boundaries.
///
/// Siblings are merged into one chunk while they fit in `chunk_size`; an
/// oversized node is split by recursing into its children. Files without a
/// usable grammar go through [`FileChunker`] instead.
#[derive(Debug, Clone)]
pub struct TreeSitterChunker {
    config: ChunkerConfig,
    filter: ChunkFilter,
    fallback: FileChunker,
}

/// Accumulated sibling span, in bytes.
struct Buffer {
    start_byte: usize,
    end_byte: usize,
    start: Position,
}

impl Buffer {
    fn from_node(node: &Node, source: &str) -> Self {
        Self {
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            start: node_start(node, source),
        }
    }
}

impl TreeSitterChunker {
    /// # Errors
    ///
    /// Returns an error if the configuration or a chunk filter is invalid.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        let fallback = FileChunker::new(config.clone())?;
        let filter = ChunkFilter::new(&config.chunk_filters)?;
        Ok(Self {
            config,
            filter,
            fallback,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Read and chunk a file, tagging each chunk with its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not UTF-8.
    pub fn chunk_file(&self, path: &Path) -> Result<Vec<Chunk>> {
        let source = read_text(path)?;
        let display = path.display().to_string();
        Ok(self
            .chunk_source(path, &source)
            .into_iter()
            .map(|c| c.with_path(display.clone()))
            .collect())
    }

    /// Chunk `source` as if read from `path`. Never fails: sources without a
    /// grammar are chunked by line windows.
    #[must_use]
    pub fn chunk_source(&self, path: &Path, source: &str) -> Vec<Chunk> {
        if source.is_empty() {
            return Vec::new();
        }
        let Some((size, _)) = self.config.window() else {
            return self.fallback.chunk(source).collect();
        };
        let Some((lang, tree)) = parse(path, source) else {
            tracing::debug!(path = %path.display(), "no grammar, using line chunker");
            return self.fallback.chunk(source).collect();
        };

        let mut chunks = Vec::new();
        chunk_node(&tree.root_node(), source, size, &mut chunks);
        if !self.filter.is_empty() {
            let before = chunks.len();
            chunks.retain(|c| !self.filter.rejects(lang.id(), &c.text));
            tracing::trace!(dropped = before - chunks.len(), %lang, "chunk filters applied");
        }
        chunks
    }
}

fn parse(path: &Path, source: &str) -> Option<(Lang, Tree)> {
    let lang = detect_language(path, source)?;
    let grammar = lang.grammar()?;
    let mut parser = Parser::new();
    parser.set_language(&grammar).ok()?;
    let tree = parser.parse(source, None)?;
    Some((lang, tree))
}

fn chunk_node(node: &Node, source: &str, size: usize, output: &mut Vec<Chunk>) {
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    let mut buffer: Option<Buffer> = None;

    for child in &children {
        let child_len = source[child.byte_range()].chars().count();

        if child_len > size {
            if let Some(buf) = buffer.take() {
                flush(&buf, source, output);
            }
            if child.child_count() == 0 {
                flush(&Buffer::from_node(child, source), source, output);
            } else {
                chunk_node(child, source, size, output);
            }
            continue;
        }

        match buffer.as_mut() {
            None => buffer = Some(Buffer::from_node(child, source)),
            Some(buf) => {
                let merged = source[buf.start_byte..child.end_byte()].chars().count();
                if merged <= size {
                    buf.end_byte = child.end_byte();
                } else {
                    flush(buf, source, output);
                    buffer = Some(Buffer::from_node(child, source));
                }
            }
        }
    }

    if let Some(buf) = buffer {
        flush(&buf, source, output);
    }
}

fn flush(buf: &Buffer, source: &str, output: &mut Vec<Chunk>) {
    let text = &source[buf.start_byte..buf.end_byte];
    if text.is_empty() {
        return;
    }
    let end = end_position(buf.start, text);
    output.push(Chunk::with_span(text, buf.start, end));
}

/// Start of a node with the column counted in chars rather than bytes.
fn node_start(node: &Node, source: &str) -> Position {
    let point = node.start_position();
    let line_start = node.start_byte().saturating_sub(point.column);
    let column = source
        .get(line_start..node.start_byte())
        .map_or(point.column, |s| s.chars().count());
    Position::new(point.row + 1, column)
}

fn end_position(start: Position, text: &str) -> Position {
    let newlines = text.matches('\n').count();
    if newlines == 0 {
        let len = text.chars().count();
        return Position::new(start.row, (start.column + len).saturating_sub(1));
    }
    let last_line = text.rsplit('\n').next().unwrap_or_default();
    Position::new(
        start.row + newlines,
        last_line.chars().count().saturating_sub(1),
    )
}
