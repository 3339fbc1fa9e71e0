//! File-backed brute-force backend.
//!
//! Each collection is one JSON document `<db_path>/<collection id>.json`.
//! Search is exact cosine distance over every record, which is fine for a
//! single project and keeps the tool usable without a Chroma install. Every
//! mutation holds the data directory lock and rewrites the file atomically.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StoreConfig;
use crate::connector::{
    BoxFuture, Prepared, StoreConnector, chunk_from_record, chunk_metadata, files_from_metadata,
    prepare_file, record_to_result, stored_path,
};
use crate::embedding::truncate_embeddings;
use crate::error::{Result, StoreError};
use crate::identity::{
    IDENTITY_FIELDS, collection_metadata, hash_file_async, owned_by_current_user,
    project_collection_id, verify_metadata,
};
use crate::registry::ClientRegistry;
use crate::types::{
    CollectionContent, CollectionInfo, Metadata, QueryOptions, QueryResult, ResultType,
    VectoriseStats,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CollectionFile {
    metadata: Metadata,
    records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: String,
    document: String,
    embedding: Vec<f32>,
    metadata: Metadata,
}

impl Record {
    fn path(&self) -> Option<&str> {
        self.metadata.get("path").and_then(Value::as_str)
    }
}

impl CollectionFile {
    fn info(&self, id: String) -> CollectionInfo {
        let text = |key: &str| {
            self.metadata
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        CollectionInfo {
            id,
            path: text("path"),
            embedding_function: text("embedding_function"),
            backend: "local".into(),
            file_count: files_from_metadata(self.records.iter().map(|r| &r.metadata)).len(),
            chunk_count: self.records.len(),
        }
    }
}

#[derive(Debug)]
pub struct LocalConnector {
    config: StoreConfig,
    registry: Arc<ClientRegistry>,
}

impl LocalConnector {
    #[must_use]
    pub fn new(config: StoreConfig, registry: Arc<ClientRegistry>) -> Self {
        Self { config, registry }
    }

    fn collection_file(&self, project_root: &Path) -> PathBuf {
        self.config
            .db_path
            .join(format!("{}.json", project_collection_id(project_root)))
    }

    async fn open(&self) -> Result<CollectionFile> {
        let path = self.collection_file(&self.config.project_root);
        let Some(collection) = load(&path).await? else {
            return Err(StoreError::CollectionNotFound {
                path: self.config.project_root.display().to_string(),
            });
        };
        verify_metadata(
            &collection_metadata(&self.config),
            &collection.metadata,
            IDENTITY_FIELDS,
        )?;
        Ok(collection)
    }

    /// Load or create the collection. Caller holds the directory lock.
    async fn open_or_create(&self, path: &Path) -> Result<CollectionFile> {
        let expected = collection_metadata(&self.config);
        if let Some(collection) = load(path).await? {
            verify_metadata(
                &expected,
                &collection.metadata,
                expected.keys().map(String::as_str),
            )?;
            return Ok(collection);
        }
        let collection = CollectionFile {
            metadata: expected,
            records: Vec::new(),
        };
        save(path, &collection).await?;
        tracing::info!(path = %self.config.project_root.display(), "collection created");
        Ok(collection)
    }

    async fn vectorise_file(&self, path: &Path, force: bool) -> Result<VectoriseStats> {
        let target = self.collection_file(&self.config.project_root);
        let file = stored_path(path);
        let sha256 = hash_file_async(path).await?;

        let (existed, unchanged) = {
            let _lock = self.registry.locks().lock(&self.config.db_path).await?;
            let existing = self.open_or_create(&target).await?;
            let stored: Vec<&Record> = existing
                .records
                .iter()
                .filter(|r| r.path() == Some(file.as_str()))
                .collect();
            let unchanged = stored
                .iter()
                .any(|r| r.metadata.get("sha256").and_then(Value::as_str) == Some(sha256.as_str()));
            (!stored.is_empty(), unchanged)
        };
        if existed && unchanged && !force {
            tracing::debug!(path = %file, "unchanged, skipping");
            return Ok(VectoriseStats::skipped());
        }

        let prepared = match prepare_file(&self.config, path, sha256).await? {
            Prepared::Undecodable => return Ok(VectoriseStats::failed()),
            other => other,
        };

        let _lock = self.registry.locks().lock(&self.config.db_path).await?;
        let mut collection = self.open_or_create(&target).await?;
        collection.records.retain(|r| r.path() != Some(file.as_str()));
        let stats = if let Prepared::Ready(prepared) = prepared {
            let count = prepared.chunks.len();
            for (chunk, embedding) in prepared.chunks.iter().zip(prepared.embeddings) {
                collection.records.push(Record {
                    id: uuid::Uuid::new_v4().to_string(),
                    document: chunk.text.clone(),
                    embedding,
                    metadata: chunk_metadata(&prepared.path, &prepared.sha256, chunk),
                });
            }
            tracing::debug!(path = %file, chunks = count, "vectorised");
            if existed {
                VectoriseStats::updated()
            } else {
                VectoriseStats::added()
            }
        } else {
            VectoriseStats::skipped()
        };
        save(&target, &collection).await?;
        Ok(stats)
    }
}

async fn load(path: &Path) -> Result<Option<CollectionFile>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn save(path: &Path, collection: &CollectionFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec(collection)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

impl StoreConnector for LocalConnector {
    fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn query<'a>(&'a self, options: &'a QueryOptions) -> BoxFuture<'a, Result<Vec<QueryResult>>> {
        Box::pin(async move {
            let collection = self.open().await?;
            if options.keywords.is_empty() {
                return Ok(Vec::new());
            }
            let limit = options.count.unwrap_or(collection.records.len());
            let mut embeddings = self.config.embedding.embed(&options.keywords).await?;
            truncate_embeddings(&mut embeddings, self.config.embedding_dims);

            let candidates: Vec<&Record> = collection
                .records
                .iter()
                .filter(|r| {
                    r.path()
                        .is_none_or(|p| !options.exclude.iter().any(|e| e == p))
                })
                .filter(|r| !options.chunk_only || r.metadata.contains_key("start"))
                .collect();

            let mut results = Vec::new();
            for (query, embedding) in options.keywords.iter().zip(&embeddings) {
                let mut scored: Vec<(f32, &Record)> = candidates
                    .iter()
                    .map(|r| (cosine_distance(embedding, &r.embedding), *r))
                    .collect();
                scored.sort_by(|a, b| a.0.total_cmp(&b.0));
                results.extend(scored.into_iter().take(limit).map(|(distance, r)| {
                    record_to_result(&r.id, Some(&r.document), &r.metadata, query, distance)
                }));
            }
            Ok(results)
        })
    }

    fn vectorise<'a>(&'a self, path: &'a Path, force: bool) -> BoxFuture<'a, Result<VectoriseStats>> {
        Box::pin(self.vectorise_file(path, force))
    }

    fn list_collection_content(
        &self,
        scope: Option<ResultType>,
    ) -> BoxFuture<'_, Result<CollectionContent>> {
        Box::pin(async move {
            let collection = self.open().await?;
            let mut content = CollectionContent::default();
            if scope != Some(ResultType::Chunk) {
                content.files = files_from_metadata(collection.records.iter().map(|r| &r.metadata));
            }
            if scope != Some(ResultType::Document) {
                content.chunks = collection
                    .records
                    .iter()
                    .map(|r| chunk_from_record(&r.id, Some(&r.document), &r.metadata))
                    .collect();
            }
            Ok(content)
        })
    }

    fn delete<'a>(&'a self, paths: &'a [String]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            if paths.is_empty() {
                return Ok(0);
            }
            let _lock = self.registry.locks().lock(&self.config.db_path).await?;
            let mut collection = self.open().await?;
            let matches = |r: &Record| r.path().is_some_and(|p| paths.iter().any(|x| x == p));
            let removed = files_from_metadata(
                collection
                    .records
                    .iter()
                    .filter(|r| matches(r))
                    .map(|r| &r.metadata),
            )
            .len();
            if removed > 0 {
                collection.records.retain(|r| !matches(r));
                save(&self.collection_file(&self.config.project_root), &collection).await?;
            }
            Ok(removed)
        })
    }

    fn drop_collection<'a>(&'a self, project_root: Option<&'a Path>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let root = project_root.unwrap_or(&self.config.project_root);
            let _lock = self.registry.locks().lock(&self.config.db_path).await?;
            match tokio::fs::remove_file(self.collection_file(root)).await {
                Ok(()) => {
                    tracing::info!(path = %root.display(), "collection dropped");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list_collections(&self) -> BoxFuture<'_, Result<Vec<CollectionInfo>>> {
        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(&self.config.db_path).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut infos = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
                    continue;
                };
                match load(&path).await {
                    Ok(Some(collection)) if owned_by_current_user(&collection.metadata) => {
                        infos.push(collection.info(id));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(path = %path.display(), "unreadable collection: {e}"),
                }
            }
            infos.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(infos)
        })
    }

    fn current_collection(&self) -> BoxFuture<'_, Result<CollectionInfo>> {
        Box::pin(async move {
            let collection = self.open().await?;
            Ok(collection.info(project_collection_id(&self.config.project_root)))
        })
    }

    fn chunk_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.open().await?.records.len()) })
    }

    fn has_line_ranges(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let collection = self.open().await?;
            Ok(collection.records.iter().any(|r| r.metadata.contains_key("start")))
        })
    }
}
