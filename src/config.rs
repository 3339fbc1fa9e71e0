use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use codevec_chunker::ChunkerConfig;
use codevec_pipeline::{QueryConfig, QueryInclude, RerankerParams};
use codevec_store::{EmbeddingParams, StoreConfig, resolve_embedding};
use serde::{Deserialize, Serialize};

pub const APP_DIR: &str = "codevec";
pub const CONFIG_FILE: &str = "config.toml";
pub const PROJECT_DIR: &str = ".codevec";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: String,
    pub db_url: String,
    pub db_path: PathBuf,
    pub db_log_path: PathBuf,
    /// Program and leading arguments used to start a bundled server.
    pub db_command: Vec<String>,
    pub db_timeout_secs: u64,
    pub max_batch_size: usize,
    pub hnsw: BTreeMap<String, serde_json::Value>,
    pub embedding_function: String,
    pub embedding_params: EmbeddingParams,
    pub embedding_dims: Option<usize>,
    pub chunk_size: i32,
    pub overlap_ratio: f64,
    pub chunk_filters: HashMap<String, Vec<String>>,
    pub n_result: usize,
    pub query_multiplier: i32,
    pub include: Vec<QueryInclude>,
    pub use_absolute_path: bool,
    pub reranker: String,
    pub reranker_params: RerankerParams,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: "chroma".into(),
            db_url: "http://127.0.0.1:8000".into(),
            db_path: data_dir().join("chromadb"),
            db_log_path: data_dir(),
            db_command: vec!["chroma".into(), "run".into()],
            db_timeout_secs: 10,
            max_batch_size: 256,
            hnsw: BTreeMap::from([("hnsw:M".to_owned(), serde_json::json!(64))]),
            embedding_function: codevec_store::embedding::DEFAULT_EMBEDDING.into(),
            embedding_params: EmbeddingParams::default(),
            embedding_dims: None,
            chunk_size: 2500,
            overlap_ratio: 0.2,
            chunk_filters: HashMap::new(),
            n_result: 1,
            query_multiplier: -1,
            include: vec![QueryInclude::Path, QueryInclude::Document],
            use_absolute_path: false,
            reranker: "naive".into(),
            reranker_params: RerankerParams::default(),
        }
    }
}

/// Directory holding the global config and spec files.
#[must_use]
pub fn global_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR))
}

/// Nearest ancestor of `start` containing `.codevec/` or `.git/`; `start` otherwise.
#[must_use]
pub fn find_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_DIR).is_dir() || dir.join(".git").exists())
        .unwrap_or(start)
        .to_path_buf()
}

fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        base.insert(key, value);
    }
}

impl Config {
    /// Load and merge TOML files in order (later files override earlier
    /// fields), then apply environment overrides. Missing files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load(paths: &[PathBuf]) -> anyhow::Result<Self> {
        let mut merged = toml::Table::new();
        for path in paths.iter().filter(|p| p.is_file()) {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let table: toml::Table = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded config layer");
            merge(&mut merged, table);
        }
        let mut config: Self = toml::Value::Table(merged)
            .try_into()
            .context("invalid config values")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config layers for a project: global file, then `<root>/.codevec/config.toml`.
    #[must_use]
    pub fn layers(project_root: &Path) -> Vec<PathBuf> {
        let mut layers: Vec<PathBuf> = global_dir().map(|d| d.join(CONFIG_FILE)).into_iter().collect();
        layers.push(project_root.join(PROJECT_DIR).join(CONFIG_FILE));
        layers
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CODEVEC_DB_URL") {
            self.db_url = v;
        }
        if let Ok(v) = std::env::var("CODEVEC_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CODEVEC_BACKEND") {
            self.backend = v;
        }
        if let Ok(v) = std::env::var("CODEVEC_EMBEDDING_FUNCTION") {
            self.embedding_function = v;
        }
        if let Ok(v) = std::env::var("CODEVEC_CHUNK_SIZE") {
            if let Ok(size) = v.parse::<i32>() {
                self.chunk_size = size;
            } else {
                tracing::warn!("ignoring invalid CODEVEC_CHUNK_SIZE value: {v}");
            }
        }
        if let Ok(v) = std::env::var("CODEVEC_OVERLAP_RATIO") {
            if let Ok(ratio) = v.parse::<f64>() {
                self.overlap_ratio = ratio;
            } else {
                tracing::warn!("ignoring invalid CODEVEC_OVERLAP_RATIO value: {v}");
            }
        }
        if let Ok(v) = std::env::var("CODEVEC_N_RESULT") {
            if let Ok(n) = v.parse::<usize>() {
                self.n_result = n;
            } else {
                tracing::warn!("ignoring invalid CODEVEC_N_RESULT value: {v}");
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error for out-of-range chunker settings, `n_result == 0`, or
    /// `include` naming both `chunk` and `document`.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.chunker().validate()?;
        if self.n_result == 0 {
            bail!("n_result must be at least 1");
        }
        if self.include.contains(&QueryInclude::Chunk) && self.include.contains(&QueryInclude::Document) {
            bail!("`include` cannot contain both `chunk` and `document`");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be at least 1");
        }
        Ok(())
    }

    #[must_use]
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: self.chunk_size,
            overlap_ratio: self.overlap_ratio,
            chunk_filters: self.chunk_filters.clone(),
        }
    }

    #[must_use]
    pub fn store_config(&self, project_root: &Path) -> StoreConfig {
        StoreConfig {
            project_root: project_root.to_path_buf(),
            chunker: self.chunker(),
            embedding: resolve_embedding(&self.embedding_function, &self.embedding_params),
            embedding_dims: self.embedding_dims,
            hnsw: self.hnsw.clone(),
            db_url: self.db_url.clone(),
            db_path: self.db_path.clone(),
            db_log_path: self.db_log_path.clone(),
            server_command: self.db_command.clone(),
            server_timeout: Duration::from_secs(self.db_timeout_secs),
            max_batch_size: self.max_batch_size,
        }
    }

    #[must_use]
    pub fn query_config(&self, project_root: &Path, queries: Vec<String>) -> QueryConfig {
        QueryConfig {
            queries,
            n_result: self.n_result,
            include: self.include.clone(),
            exclude: Vec::new(),
            query_multiplier: self.query_multiplier,
            use_absolute_path: self.use_absolute_path,
            project_root: project_root.to_path_buf(),
            chunker: self.chunker(),
        }
    }
}
