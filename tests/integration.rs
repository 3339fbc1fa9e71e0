use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codevec_chunker::ChunkerConfig;
use codevec_pipeline::{
    Indexer, NaiveReranker, QueryConfig, QueryInclude, SpecFiles, expand_paths, query,
};
use codevec_store::{
    BackendRegistry, ClientRegistry, HashingEmbedding, ResultType, StoreConfig, StoreConnector,
    count,
};

struct Project {
    _dir: tempfile::TempDir,
    root: PathBuf,
    db: PathBuf,
}

fn project() -> Project {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    let db = dir.path().join("db");
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::create_dir_all(root.join("target")).unwrap();
    std::fs::write(root.join(".gitignore"), "target/\n").unwrap();
    std::fs::write(
        root.join("src/config.rs"),
        "pub struct Config {\n    pub port: u16,\n}\n\npub fn load_config_from_toml(path: &str) -> Config {\n    Config { port: 8080 }\n}\n",
    )
    .unwrap();
    std::fs::write(
        root.join("src/server.rs"),
        "pub async fn accept_tcp_connections(listener: TcpListener) {\n    loop {}\n}\n",
    )
    .unwrap();
    std::fs::write(
        root.join("src/retry.rs"),
        "pub fn exponential_backoff_delay(attempt: u32) -> u64 {\n    100 << attempt\n}\n",
    )
    .unwrap();
    std::fs::write(root.join("target/build.rs"), "fn generated() {}\n").unwrap();
    Project { _dir: dir, root, db }
}

fn store_config(root: &Path, db: &Path) -> StoreConfig {
    StoreConfig {
        project_root: root.to_path_buf(),
        chunker: ChunkerConfig::new(400, 0.2),
        embedding: Arc::new(HashingEmbedding::default()),
        embedding_dims: None,
        hnsw: BTreeMap::new(),
        db_url: "http://127.0.0.1:1".into(),
        db_path: db.to_path_buf(),
        db_log_path: db.to_path_buf(),
        server_command: Vec::new(),
        server_timeout: Duration::from_secs(1),
        max_batch_size: 64,
    }
}

async fn connect(p: &Project, clients: &Arc<ClientRegistry>) -> Arc<dyn StoreConnector> {
    let connector = BackendRegistry::default()
        .connect("local", store_config(&p.root, &p.db), Arc::clone(clients))
        .await
        .unwrap();
    Arc::from(connector)
}

fn project_files(root: &Path) -> Vec<PathBuf> {
    let specs = SpecFiles::load(root, None, true).unwrap();
    specs.filter_excluded(expand_paths(&[".".to_owned()], root, true, false).unwrap())
}

#[tokio::test]
async fn index_query_and_orphan_cleanup() {
    let p = project();
    let clients = Arc::new(ClientRegistry::new());
    let connector = connect(&p, &clients).await;
    let indexer = Indexer::new(Arc::clone(&connector)).with_concurrency(2);

    let files = project_files(&p.root);
    assert_eq!(files.len(), 3, "hidden and gitignored files are excluded: {files:?}");

    let first = indexer.index(files.clone(), false).await.unwrap();
    assert_eq!(first.add, 3);
    assert_eq!(first.failed, 0);

    let second = indexer.index(files, false).await.unwrap();
    assert_eq!((second.add, second.update), (0, 0));
    assert_eq!(second.skipped, 3);

    let mut config = QueryConfig::new(&p.root, vec!["load config from toml".to_owned()]);
    config.n_result = 2;
    let outputs = query(connector.as_ref(), &NaiveReranker::default(), &config)
        .await
        .unwrap();
    assert!(!outputs.is_empty());
    assert_eq!(outputs[0].path.as_deref(), Some("src/config.rs"));
    assert!(outputs[0].document.as_deref().unwrap().contains("load_config_from_toml"));

    config.include = vec![QueryInclude::Chunk];
    config.queries = vec!["exponential backoff delay".to_owned()];
    config.n_result = 1;
    let chunks = query(connector.as_ref(), &NaiveReranker::default(), &config)
        .await
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].chunk.as_deref().unwrap().contains("exponential_backoff_delay"));
    assert_eq!(chunks[0].start_line, Some(1));

    std::fs::remove_file(p.root.join("src/server.rs")).unwrap();
    let chunks_before = count(connector.as_ref(), ResultType::Chunk).await.unwrap();
    let third = indexer.update().await.unwrap();
    assert_eq!(third.removed, 1);
    assert_eq!(count(connector.as_ref(), ResultType::Document).await.unwrap(), 2);
    assert!(count(connector.as_ref(), ResultType::Chunk).await.unwrap() < chunks_before);

    clients.shutdown().await;
}

#[tokio::test]
async fn separate_runs_share_the_on_disk_collection() {
    let p = project();
    let files = project_files(&p.root);
    {
        let clients = Arc::new(ClientRegistry::new());
        let connector = connect(&p, &clients).await;
        Indexer::new(connector).index(files.clone(), false).await.unwrap();
        clients.shutdown().await;
    }

    let clients = Arc::new(ClientRegistry::new());
    let connector = connect(&p, &clients).await;
    let info = connector.current_collection().await.unwrap();
    assert_eq!(info.file_count, 3);
    assert_eq!(info.embedding_function, "hashing");

    let again = Indexer::new(connector).index(files, false).await.unwrap();
    assert_eq!(again.skipped, 3);
    clients.shutdown().await;
}
