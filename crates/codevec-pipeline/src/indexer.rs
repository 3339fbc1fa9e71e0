//! Incremental, bounded-concurrency vectorisation of file sets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codevec_store::identity::hash_file_async;
use codevec_store::{
    CollectionContent, ResultType, StoreConnector, StoreError, VectoriseStats, check_orphans,
};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

/// Errors that make the rest of the run pointless.
fn is_fatal(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::MetadataMismatch { .. }
            | StoreError::EmbeddingMismatch { .. }
            | StoreError::ServerTimeout { .. }
            | StoreError::Spawn(_)
            | StoreError::Config(_)
            | StoreError::UnknownBackend(_)
    )
}

fn absolute(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

/// Treat a missing collection as empty.
fn or_empty(content: codevec_store::Result<CollectionContent>) -> Result<CollectionContent> {
    match content {
        Err(StoreError::CollectionNotFound { .. }) => Ok(CollectionContent::default()),
        other => Ok(other?),
    }
}

/// Drives a [`StoreConnector`] over many files.
pub struct Indexer {
    connector: Arc<dyn StoreConnector>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("backend", &self.connector.backend_name())
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Indexer {
    #[must_use]
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        let concurrency = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            connector,
            concurrency,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Vectorise `files` and remove stored files that no longer exist.
    ///
    /// Unless `force`, files whose content hash matches the stored one are
    /// counted as skipped without being chunked. With `force`, every file is
    /// rebuilt; each one's old chunks are replaced only when its unit runs.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] when the token fires, or the first
    /// store error that invalidates the whole run. Per-file failures are only
    /// counted.
    pub async fn index(&self, files: Vec<PathBuf>, force: bool) -> Result<VectoriseStats> {
        let mut stats = VectoriseStats::default();
        let pending = if force {
            files
        } else {
            let stored: HashMap<String, String> = or_empty(
                self.connector
                    .list_collection_content(Some(ResultType::Document))
                    .await,
            )?
            .files
            .into_iter()
            .map(|f| (f.path, f.sha256))
            .collect();

            let mut pending = Vec::with_capacity(files.len());
            for file in files {
                let unchanged = match stored.get(&absolute(&file)) {
                    Some(sha) => hash_file_async(&file).await.is_ok_and(|h| &h == sha),
                    None => false,
                };
                if unchanged {
                    stats.skipped += 1;
                } else {
                    pending.push(file);
                }
            }
            pending
        };

        tracing::info!(
            files = pending.len(),
            skipped = stats.skipped,
            concurrency = self.concurrency,
            "indexing started"
        );
        stats += self.run_units(pending, force).await?;

        match check_orphans(self.connector.as_ref()).await {
            Ok(removed) => stats.removed += removed,
            Err(StoreError::CollectionNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(
            added = stats.add,
            updated = stats.update,
            removed = stats.removed,
            skipped = stats.skipped,
            failed = stats.failed,
            "indexing finished"
        );
        Ok(stats)
    }

    /// Re-vectorise every indexed file still on disk, then remove orphans.
    ///
    /// # Errors
    ///
    /// Same as [`Indexer::index`].
    pub async fn update(&self) -> Result<VectoriseStats> {
        let content = or_empty(
            self.connector
                .list_collection_content(Some(ResultType::Document))
                .await,
        )?;
        let existing: Vec<PathBuf> = content
            .files
            .into_iter()
            .map(|f| PathBuf::from(f.path))
            .filter(|p| p.is_file())
            .collect();
        self.index(existing, false).await
    }

    async fn run_units(&self, files: Vec<PathBuf>, force: bool) -> Result<VectoriseStats> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let stats = Arc::new(Mutex::new(VectoriseStats::default()));
        let mut units = JoinSet::new();

        for file in files {
            let connector = Arc::clone(&self.connector);
            let semaphore = Arc::clone(&semaphore);
            let stats = Arc::clone(&stats);
            units.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Ok(());
                };
                match connector.vectorise(&file, force).await {
                    Ok(s) => {
                        *stats.lock().await += s;
                        Ok(())
                    }
                    Err(e) if is_fatal(&e) => Err(e),
                    Err(e) => {
                        tracing::warn!(path = %file.display(), "vectorise failed: {e}");
                        *stats.lock().await += VectoriseStats::failed();
                        Ok(())
                    }
                }
            });
        }

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    units.abort_all();
                    tracing::warn!(outstanding = units.len(), "indexing cancelled");
                    return Err(PipelineError::Cancelled);
                }
                joined = units.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            units.abort_all();
                            return Err(e.into());
                        }
                        Err(e) => {
                            tracing::error!("indexing unit panicked: {e}");
                            *stats.lock().await += VectoriseStats::failed();
                        }
                    }
                }
            }
        }

        let totals = *stats.lock().await;
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use codevec_chunker::ChunkerConfig;
    use codevec_store::{
        BoxFuture, ClientRegistry, CollectionInfo, HashingEmbedding, LocalConnector, QueryOptions,
        QueryResult, StoreConfig,
    };

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        connector: Arc<dyn StoreConnector>,
    }

    fn store_config(root: &Path, db: &Path) -> StoreConfig {
        StoreConfig {
            project_root: root.to_path_buf(),
            chunker: ChunkerConfig::new(200, 0.2),
            embedding: Arc::new(HashingEmbedding::default()),
            embedding_dims: None,
            hnsw: BTreeMap::new(),
            db_url: "http://127.0.0.1:1".into(),
            db_path: db.to_path_buf(),
            db_log_path: db.to_path_buf(),
            server_command: Vec::new(),
            server_timeout: Duration::from_secs(1),
            max_batch_size: 16,
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("project");
        let db = dir.path().join("db");
        std::fs::create_dir_all(&root).unwrap();
        let connector = LocalConnector::new(store_config(&root, &db), Arc::new(ClientRegistry::new()));
        Fixture {
            _dir: dir,
            root,
            connector: Arc::new(connector),
        }
    }

    fn write_files(root: &Path, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let path = root.join(format!("mod{i}.rs"));
                std::fs::write(&path, format!("pub fn handler_{i}() -> u32 {{ {i} }}\n")).unwrap();
                path
            })
            .collect()
    }

    #[tokio::test]
    async fn reindexing_unchanged_files_skips_them() {
        let f = fixture();
        let files = write_files(&f.root, 4);
        let indexer = Indexer::new(Arc::clone(&f.connector)).with_concurrency(2);

        let first = indexer.index(files.clone(), false).await.unwrap();
        assert_eq!(first.add, 4);
        assert_eq!(first.failed, 0);

        let second = indexer.index(files, false).await.unwrap();
        assert_eq!(second.add, 0);
        assert_eq!(second.update, 0);
        assert_eq!(second.skipped, 4);
    }

    #[tokio::test]
    async fn force_rebuilds_every_file() {
        let f = fixture();
        let files = write_files(&f.root, 3);
        let indexer = Indexer::new(Arc::clone(&f.connector));
        indexer.index(files.clone(), false).await.unwrap();

        let forced = indexer.index(files, true).await.unwrap();
        assert_eq!(forced.skipped, 0);
        assert_eq!(forced.update, 3);
        assert_eq!(forced.add, 0);
    }

    #[tokio::test]
    async fn deleted_file_is_removed_as_orphan() {
        let f = fixture();
        let files = write_files(&f.root, 3);
        let indexer = Indexer::new(Arc::clone(&f.connector));
        indexer.index(files.clone(), false).await.unwrap();

        std::fs::remove_file(&files[1]).unwrap();
        let stats = indexer.index(vec![files[0].clone()], false).await.unwrap();
        assert_eq!(stats.removed, 1);

        let remaining = f
            .connector
            .list_collection_content(Some(ResultType::Document))
            .await
            .unwrap();
        let paths: Vec<String> = remaining.files.into_iter().map(|f| f.path).collect();
        assert_eq!(paths.len(), 2);
        assert!(!paths.contains(&absolute(&files[1])));
    }

    #[tokio::test]
    async fn binary_file_counts_as_failed_without_aborting() {
        let f = fixture();
        let mut files = write_files(&f.root, 2);
        let blob = f.root.join("blob.bin");
        std::fs::write(&blob, [0xff, 0xfe, 0x00, 0x81]).unwrap();
        files.push(blob);

        let stats = Indexer::new(Arc::clone(&f.connector))
            .index(files, false)
            .await
            .unwrap();
        assert_eq!(stats.add, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn update_revisits_changed_files() {
        let f = fixture();
        let files = write_files(&f.root, 3);
        let indexer = Indexer::new(Arc::clone(&f.connector));
        indexer.index(files.clone(), false).await.unwrap();

        std::fs::write(&files[0], "pub fn rewritten() {}\n").unwrap();
        std::fs::remove_file(&files[2]).unwrap();
        let stats = indexer.update().await.unwrap();
        assert_eq!(stats.update, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.removed, 1);
    }

    #[tokio::test]
    async fn update_without_collection_is_empty() {
        let f = fixture();
        let stats = Indexer::new(f.connector).update().await.unwrap();
        assert_eq!(stats, VectoriseStats::default());
    }

    /// Blocks every vectorise call until cancelled.
    struct StallingConnector(StoreConfig);

    impl StoreConnector for StallingConnector {
        fn config(&self) -> &StoreConfig {
            &self.0
        }

        fn backend_name(&self) -> &'static str {
            "stalling"
        }

        fn query<'a>(&'a self, _: &'a QueryOptions) -> BoxFuture<'a, codevec_store::Result<Vec<QueryResult>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn vectorise<'a>(
            &'a self,
            _: &'a Path,
            _: bool,
        ) -> BoxFuture<'a, codevec_store::Result<VectoriseStats>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(VectoriseStats::added())
            })
        }

        fn list_collection_content(
            &self,
            _: Option<ResultType>,
        ) -> BoxFuture<'_, codevec_store::Result<CollectionContent>> {
            Box::pin(async { Ok(CollectionContent::default()) })
        }

        fn delete<'a>(&'a self, _: &'a [String]) -> BoxFuture<'a, codevec_store::Result<usize>> {
            Box::pin(async { Ok(0) })
        }

        fn drop_collection<'a>(&'a self, _: Option<&'a Path>) -> BoxFuture<'a, codevec_store::Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn list_collections(&self) -> BoxFuture<'_, codevec_store::Result<Vec<CollectionInfo>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn current_collection(&self) -> BoxFuture<'_, codevec_store::Result<CollectionInfo>> {
            Box::pin(async {
                Err(StoreError::CollectionNotFound {
                    path: String::new(),
                })
            })
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_outstanding_units() {
        let dir = tempfile::tempdir().unwrap();
        let files = write_files(dir.path(), 3);
        let connector = Arc::new(StallingConnector(store_config(dir.path(), dir.path())));
        let cancel = CancellationToken::new();
        let indexer = Indexer::new(connector).with_cancellation(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = indexer.index(files, false).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        trigger.await.unwrap();
    }
}
