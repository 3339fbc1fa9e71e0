use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use codevec_chunker::{Chunk, ChunkerError, Position, TreeSitterChunker};

use crate::config::StoreConfig;
use crate::embedding::truncate_embeddings;
use crate::error::{Result, StoreError};
use crate::types::{
    CollectionContent, CollectionInfo, IndexedFile, Metadata, QueryOptions, QueryResult,
    ResultType, VectoriseStats,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One vector-store backend bound to one project collection.
///
/// Methods that read a collection return [`StoreError::CollectionNotFound`]
/// when it does not exist; only [`StoreConnector::vectorise`] creates it.
pub trait StoreConnector: Send + Sync {
    fn config(&self) -> &StoreConfig;

    /// Backend tag, e.g. `chroma`.
    fn backend_name(&self) -> &'static str;

    /// Similarity search for every keyword in `options`.
    fn query<'a>(&'a self, options: &'a QueryOptions) -> BoxFuture<'a, Result<Vec<QueryResult>>>;

    /// Chunk, embed and store one file, replacing its previous chunks.
    ///
    /// A file whose stored hash matches is skipped unless `force`.
    fn vectorise<'a>(&'a self, path: &'a Path, force: bool)
    -> BoxFuture<'a, Result<VectoriseStats>>;

    /// Stored files and/or chunks. `None` lists both.
    fn list_collection_content(
        &self,
        scope: Option<ResultType>,
    ) -> BoxFuture<'_, Result<CollectionContent>>;

    /// Remove every chunk of the given absolute paths; returns the number of
    /// files that had chunks.
    fn delete<'a>(&'a self, paths: &'a [String]) -> BoxFuture<'a, Result<usize>>;

    /// Drop the collection of `project_root`, or of the configured project.
    fn drop_collection<'a>(&'a self, project_root: Option<&'a Path>) -> BoxFuture<'a, Result<()>>;

    /// Collections created by this tool for the current user on this host.
    fn list_collections(&self) -> BoxFuture<'_, Result<Vec<CollectionInfo>>>;

    /// Summary of the configured project's collection.
    fn current_collection(&self) -> BoxFuture<'_, Result<CollectionInfo>>;

    /// Number of stored chunks.
    fn chunk_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            Ok(self
                .list_collection_content(Some(ResultType::Chunk))
                .await?
                .chunks
                .len())
        })
    }

    /// Whether at least one stored chunk carries a line range.
    fn has_line_ranges(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            Ok(self
                .list_collection_content(Some(ResultType::Chunk))
                .await?
                .chunks
                .iter()
                .any(Chunk::has_span))
        })
    }
}

/// Delete stored files that no longer exist on disk. Returns how many were removed.
///
/// # Errors
///
/// Propagates connector errors.
pub async fn check_orphans(connector: &dyn StoreConnector) -> Result<usize> {
    let content = connector
        .list_collection_content(Some(ResultType::Document))
        .await?;
    let orphans: Vec<String> = content
        .files
        .into_iter()
        .map(|f| f.path)
        .filter(|p| !Path::new(p).exists())
        .collect();
    if orphans.is_empty() {
        return Ok(0);
    }
    tracing::info!(count = orphans.len(), "removing orphaned files");
    connector.delete(&orphans).await
}

/// Drop every listed collection that holds no chunks; returns their project paths.
///
/// # Errors
///
/// Propagates connector errors.
pub async fn cleanup(connector: &dyn StoreConnector) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for info in connector.list_collections().await? {
        if info.chunk_count == 0 {
            tracing::info!(path = %info.path, "dropping empty collection");
            connector
                .drop_collection(Some(Path::new(&info.path)))
                .await?;
            removed.push(info.path);
        }
    }
    Ok(removed)
}

/// Number of stored files (`Document`) or chunks (`Chunk`).
///
/// # Errors
///
/// Propagates connector errors.
pub async fn count(connector: &dyn StoreConnector, scope: ResultType) -> Result<usize> {
    match scope {
        ResultType::Document => Ok(connector
            .list_collection_content(Some(scope))
            .await?
            .files
            .len()),
        ResultType::Chunk => connector.chunk_count().await,
    }
}

/// Fail when the collection was built with another embedding function.
///
/// # Errors
///
/// Returns [`StoreError::EmbeddingMismatch`] on mismatch, or connector errors.
pub async fn verify_embedding_function(connector: &dyn StoreConnector) -> Result<()> {
    let info = connector.current_collection().await?;
    let configured = connector.config().embedding.name();
    if info.embedding_function == configured {
        Ok(())
    } else {
        Err(StoreError::EmbeddingMismatch {
            stored: info.embedding_function,
            configured: configured.to_owned(),
        })
    }
}

/// Chunks and vectors of one file, ready to be written.
#[derive(Debug)]
pub(crate) struct PreparedFile {
    pub path: String,
    pub sha256: String,
    pub chunks: Vec<Chunk>,
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug)]
pub(crate) enum Prepared {
    Ready(PreparedFile),
    Empty,
    Undecodable,
}

/// Absolute, display-form path used as the stored `path` value.
pub(crate) fn stored_path(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .into_owned()
}

/// Chunk on the blocking pool, then embed.
pub(crate) async fn prepare_file(config: &StoreConfig, path: &Path, sha256: String) -> Result<Prepared> {
    let chunker_config = config.chunker.clone();
    let owned = path.to_path_buf();
    let chunked = tokio::task::spawn_blocking(move || {
        TreeSitterChunker::new(chunker_config)?.chunk_file(&owned)
    })
    .await
    .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;

    let chunks = match chunked {
        Ok(chunks) => chunks,
        Err(ChunkerError::Decode { path }) => {
            tracing::warn!(%path, "not a text file");
            return Ok(Prepared::Undecodable);
        }
        Err(e) => return Err(e.into()),
    };
    if chunks.is_empty() {
        return Ok(Prepared::Empty);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let mut embeddings = config.embedding.embed(&texts).await?;
    truncate_embeddings(&mut embeddings, config.embedding_dims);
    Ok(Prepared::Ready(PreparedFile {
        path: stored_path(path),
        sha256,
        chunks,
        embeddings,
    }))
}

/// Stored metadata of one chunk.
pub(crate) fn chunk_metadata(path: &str, sha256: &str, chunk: &Chunk) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("path".into(), path.into());
    meta.insert("sha256".into(), sha256.into());
    if let (Some(start), Some(end)) = (chunk.start, chunk.end) {
        meta.insert("start".into(), start.row.into());
        meta.insert("end".into(), end.row.into());
        meta.insert("start_col".into(), start.column.into());
        meta.insert("end_col".into(), end.column.into());
    }
    meta
}

/// Rebuild a chunk from a stored record.
pub(crate) fn chunk_from_record(id: &str, document: Option<&str>, meta: &Metadata) -> Chunk {
    let mut chunk = Chunk::new(document.unwrap_or_default()).with_id(id);
    if let Some(path) = meta.get("path").and_then(|v| v.as_str()) {
        chunk = chunk.with_path(path);
    }
    let field = |key: &str| {
        meta.get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    };
    if let (Some(start), Some(end)) = (field("start"), field("end")) {
        chunk.start = Some(Position::new(start, field("start_col").unwrap_or(0)));
        chunk.end = Some(Position::new(end, field("end_col").unwrap_or(0)));
    }
    chunk
}

/// Convert one search hit; scores are negated distances so higher is better.
pub(crate) fn record_to_result(
    id: &str,
    document: Option<&str>,
    meta: &Metadata,
    query: &str,
    distance: f32,
) -> QueryResult {
    let chunk = chunk_from_record(id, document, meta);
    let path = chunk.path.clone().unwrap_or_default();
    QueryResult::new(path, chunk, query, -distance)
}

/// Distinct `(path, sha256)` pairs of stored records.
pub(crate) fn files_from_metadata<'a>(metas: impl Iterator<Item = &'a Metadata>) -> Vec<IndexedFile> {
    let mut files: Vec<IndexedFile> = metas
        .filter_map(|m| {
            Some(IndexedFile {
                path: m.get("path")?.as_str()?.to_owned(),
                sha256: m
                    .get("sha256")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned(),
            })
        })
        .collect();
    files.sort();
    files.dedup_by(|a, b| a.path == b.path);
    files
}
