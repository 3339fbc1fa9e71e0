//! Chroma backend.
//!
//! Talks to a remote server when `db_url` answers its heartbeat, otherwise to a
//! bundled server started on `db_path`. Writes against a bundled server take
//! the data directory lock.

pub mod client;
pub mod server;

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};

use self::client::{AddRecords, CollectionModel, and_filter};
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
use crate::lock::DirLock;
use crate::registry::{ChromaHandle, ClientRegistry};
use crate::types::{
    CollectionContent, CollectionInfo, QueryOptions, QueryResult, ResultType, VectoriseStats,
};

pub struct ChromaConnector {
    config: StoreConfig,
    registry: Arc<ClientRegistry>,
    handle: Arc<ChromaHandle>,
}

impl std::fmt::Debug for ChromaConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromaConnector")
            .field("project_root", &self.config.project_root)
            .field("url", &self.handle.client().base_url())
            .field("bundled", &self.handle.is_bundled())
            .finish_non_exhaustive()
    }
}

impl ChromaConnector {
    /// # Errors
    ///
    /// Returns an error if no server is reachable and none can be started.
    pub async fn connect(config: StoreConfig, registry: Arc<ClientRegistry>) -> Result<Self> {
        let handle = registry.chroma(&config).await?;
        Ok(Self {
            config,
            registry,
            handle,
        })
    }

    async fn write_lock(&self) -> Result<Option<DirLock>> {
        if !self.handle.is_bundled() {
            return Ok(None);
        }
        self.registry
            .locks()
            .lock(&self.config.db_path)
            .await
            .map(Some)
    }

    /// Existing collection of the configured project, identity checked.
    async fn open(&self) -> Result<CollectionModel> {
        let id = project_collection_id(&self.config.project_root);
        let Some(collection) = self.handle.client().get_collection(&id).await? else {
            return Err(StoreError::CollectionNotFound {
                path: self.config.project_root.display().to_string(),
            });
        };
        verify_metadata(
            &collection_metadata(&self.config),
            &collection.metadata(),
            IDENTITY_FIELDS,
        )?;
        Ok(collection)
    }

    async fn open_or_create(&self) -> Result<CollectionModel> {
        let id = project_collection_id(&self.config.project_root);
        let expected = collection_metadata(&self.config);
        let _lock = self.write_lock().await?;
        let collection = self
            .handle
            .client()
            .get_or_create_collection(&id, &expected)
            .await?;
        verify_metadata(
            &expected,
            &collection.metadata(),
            expected.keys().map(String::as_str),
        )?;
        Ok(collection)
    }

    async fn max_batch_size(&self) -> usize {
        match self.handle.client().max_batch_size().await {
            Ok(size) => size.max(1),
            Err(e) => {
                tracing::debug!("pre-flight checks unavailable: {e}");
                self.config.max_batch_size.max(1)
            }
        }
    }

    async fn summarise(&self, collection: &CollectionModel) -> Result<CollectionInfo> {
        let meta = collection.metadata();
        let records = self
            .handle
            .client()
            .get(&collection.id, None, &["metadatas"])
            .await?;
        let metadatas: Vec<_> = records.metadatas.unwrap_or_default().into_iter().flatten().collect();
        let text = |key: &str| {
            meta.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        Ok(CollectionInfo {
            id: collection.name.clone(),
            path: text("path"),
            embedding_function: text("embedding_function"),
            backend: self.backend_name().to_owned(),
            file_count: files_from_metadata(metadatas.iter()).len(),
            chunk_count: records.ids.len(),
        })
    }

    async fn vectorise_file(&self, path: &Path, force: bool) -> Result<VectoriseStats> {
        let collection = self.open_or_create().await?;
        let client = self.handle.client();
        let file = stored_path(path);
        let sha256 = hash_file_async(path).await?;

        let existing = client
            .get(&collection.id, Some(json!({ "path": file })), &["metadatas"])
            .await?;
        let existed = !existing.ids.is_empty();
        let unchanged = existing
            .metadatas
            .iter()
            .flatten()
            .flatten()
            .any(|m| m.get("sha256").and_then(Value::as_str) == Some(sha256.as_str()));
        if existed && unchanged && !force {
            tracing::debug!(path = %file, "unchanged, skipping");
            return Ok(VectoriseStats::skipped());
        }

        let prepared = match prepare_file(&self.config, path, sha256).await? {
            Prepared::Undecodable => return Ok(VectoriseStats::failed()),
            other => other,
        };

        let max_batch = self.max_batch_size().await;
        let _lock = self.write_lock().await?;
        if existed {
            client
                .delete_where(&collection.id, json!({ "path": file }))
                .await?;
        }
        let Prepared::Ready(prepared) = prepared else {
            return Ok(VectoriseStats::skipped());
        };

        for (chunks, embeddings) in prepared
            .chunks
            .chunks(max_batch)
            .zip(prepared.embeddings.chunks(max_batch))
        {
            let records = AddRecords {
                ids: chunks.iter().map(|_| uuid::Uuid::new_v4().to_string()).collect(),
                embeddings,
                documents: chunks.iter().map(|c| c.text.as_str()).collect(),
                metadatas: chunks
                    .iter()
                    .map(|c| chunk_metadata(&prepared.path, &prepared.sha256, c))
                    .collect(),
            };
            client.add(&collection.id, &records).await?;
        }
        tracing::debug!(path = %file, chunks = prepared.chunks.len(), "vectorised");
        Ok(if existed {
            VectoriseStats::updated()
        } else {
            VectoriseStats::added()
        })
    }
}

impl StoreConnector for ChromaConnector {
    fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn backend_name(&self) -> &'static str {
        "chroma"
    }

    fn query<'a>(&'a self, options: &'a QueryOptions) -> BoxFuture<'a, Result<Vec<QueryResult>>> {
        Box::pin(async move {
            if options.keywords.is_empty() {
                return Ok(Vec::new());
            }
            let collection = self.open().await?;
            let client = self.handle.client();
            let n_results = match options.count {
                Some(n) => n,
                None => client.count(&collection.id).await?,
            };
            if n_results == 0 {
                return Ok(Vec::new());
            }

            let mut clauses = Vec::new();
            if !options.exclude.is_empty() {
                clauses.push(json!({ "path": { "$nin": options.exclude } }));
            }
            if options.chunk_only {
                clauses.push(json!({ "start": { "$gte": 0 } }));
            }

            let mut embeddings = self.config.embedding.embed(&options.keywords).await?;
            truncate_embeddings(&mut embeddings, self.config.embedding_dims);
            let rows = client
                .query(&collection.id, &embeddings, n_results, and_filter(clauses))
                .await?;

            let documents = rows.documents.unwrap_or_default();
            let metadatas = rows.metadatas.unwrap_or_default();
            let distances = rows.distances.unwrap_or_default();
            let mut results = Vec::new();
            for (i, ids) in rows.ids.iter().enumerate() {
                let query = &options.keywords[i.min(options.keywords.len() - 1)];
                for (j, id) in ids.iter().enumerate() {
                    let document = documents.get(i).and_then(|d| d.get(j)).and_then(Option::as_deref);
                    let meta = metadatas
                        .get(i)
                        .and_then(|m| m.get(j))
                        .cloned()
                        .flatten()
                        .unwrap_or_default();
                    let distance = distances
                        .get(i)
                        .and_then(|d| d.get(j))
                        .copied()
                        .flatten()
                        .unwrap_or(f32::MAX);
                    results.push(record_to_result(id, document, &meta, query, distance));
                }
            }
            tracing::debug!(hits = results.len(), "chroma query done");
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
            let include: &[&str] = match scope {
                Some(ResultType::Document) => &["metadatas"],
                _ => &["metadatas", "documents"],
            };
            let records = self
                .handle
                .client()
                .get(&collection.id, None, include)
                .await?;
            let metadatas: Vec<_> = records
                .metadatas
                .unwrap_or_default()
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect();
            let mut content = CollectionContent::default();
            if scope != Some(ResultType::Chunk) {
                content.files = files_from_metadata(metadatas.iter());
            }
            if scope != Some(ResultType::Document) {
                let documents = records.documents.unwrap_or_default();
                content.chunks = records
                    .ids
                    .iter()
                    .zip(&metadatas)
                    .enumerate()
                    .map(|(i, (id, meta))| {
                        let document = documents.get(i).and_then(Option::as_deref);
                        chunk_from_record(id, document, meta)
                    })
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
            let collection = self.open().await?;
            let client = self.handle.client();
            let filter = json!({ "path": { "$in": paths } });
            let matched = client
                .get(&collection.id, Some(filter.clone()), &["metadatas"])
                .await?;
            let metadatas: Vec<_> = matched.metadatas.unwrap_or_default().into_iter().flatten().collect();
            let removed = files_from_metadata(metadatas.iter()).len();
            if removed > 0 {
                let _lock = self.write_lock().await?;
                client.delete_where(&collection.id, filter).await?;
            }
            tracing::debug!(removed, "deleted files from collection");
            Ok(removed)
        })
    }

    fn drop_collection<'a>(&'a self, project_root: Option<&'a Path>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let root = project_root.unwrap_or(&self.config.project_root);
            let id = project_collection_id(root);
            let _lock = self.write_lock().await?;
            self.handle.client().delete_collection(&id).await?;
            tracing::info!(path = %root.display(), "collection dropped");
            Ok(())
        })
    }

    fn list_collections(&self) -> BoxFuture<'_, Result<Vec<CollectionInfo>>> {
        Box::pin(async move {
            let mut infos = Vec::new();
            for collection in self.handle.client().list_collections().await? {
                if owned_by_current_user(&collection.metadata()) {
                    infos.push(self.summarise(&collection).await?);
                }
            }
            Ok(infos)
        })
    }

    fn current_collection(&self) -> BoxFuture<'_, Result<CollectionInfo>> {
        Box::pin(async move {
            let collection = self.open().await?;
            self.summarise(&collection).await
        })
    }

    fn chunk_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let collection = self.open().await?;
            self.handle.client().count(&collection.id).await
        })
    }

    fn has_line_ranges(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let collection = self.open().await?;
            self.handle
                .client()
                .any(&collection.id, json!({ "start": { "$gte": 0 } }))
                .await
        })
    }
}
