use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use codevec_chunker::ChunkerConfig;

use crate::embedding::EmbeddingFunction;

/// Everything a connector needs for one project.
#[derive(Clone)]
pub struct StoreConfig {
    /// Absolute project root; the collection id is derived from it.
    pub project_root: PathBuf,
    pub chunker: ChunkerConfig,
    pub embedding: Arc<dyn EmbeddingFunction>,
    /// Truncate embeddings to this many dimensions.
    pub embedding_dims: Option<usize>,
    /// ANN construction parameters stored as collection metadata.
    pub hnsw: BTreeMap<String, serde_json::Value>,
    /// Remote server URL. When unreachable, a bundled server is started.
    pub db_url: String,
    pub db_path: PathBuf,
    pub db_log_path: PathBuf,
    /// Program and leading arguments of the bundled server.
    pub server_command: Vec<String>,
    pub server_timeout: Duration,
    /// Chroma write batch size used when the server does not report its own limit.
    pub max_batch_size: usize,
}

impl StoreConfig {
    /// Collection metadata keys for ANN parameters, normalised to the `hnsw:` prefix.
    #[must_use]
    pub fn hnsw_metadata(&self) -> BTreeMap<String, serde_json::Value> {
        self.hnsw
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| {
                let key = if k.starts_with("hnsw:") {
                    k.clone()
                } else {
                    format!("hnsw:{k}")
                };
                (key, v.clone())
            })
            .collect()
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("project_root", &self.project_root)
            .field("chunker", &self.chunker)
            .field("embedding", &self.embedding.name())
            .field("embedding_dims", &self.embedding_dims)
            .field("db_url", &self.db_url)
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use super::*;
    use crate::embedding::HashingEmbedding;

    pub fn store_config(project_root: &Path, db_path: &Path) -> StoreConfig {
        StoreConfig {
            project_root: project_root.to_path_buf(),
            chunker: ChunkerConfig::new(200, 0.2),
            embedding: Arc::new(HashingEmbedding::default()),
            embedding_dims: None,
            hnsw: BTreeMap::from([("hnsw:M".to_owned(), serde_json::json!(64))]),
            db_url: "http://127.0.0.1:1".into(),
            db_path: db_path.to_path_buf(),
            db_log_path: db_path.to_path_buf(),
            server_command: vec!["chroma".into(), "run".into()],
            server_timeout: Duration::from_secs(10),
            max_batch_size: 2,
        }
    }

    #[test]
    fn hnsw_keys_get_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = store_config(dir.path(), dir.path());
        config.hnsw.insert("ef".into(), serde_json::json!(100));
        config.hnsw.insert("space".into(), serde_json::Value::Null);
        let meta = config.hnsw_metadata();
        assert_eq!(meta.get("hnsw:ef"), Some(&serde_json::json!(100)));
        assert_eq!(meta.get("hnsw:M"), Some(&serde_json::json!(64)));
        assert!(!meta.contains_key("hnsw:space"));
    }
}
