use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::chroma::client::ChromaClient;
use crate::chroma::server::{BundledServer, try_server};
use crate::config::StoreConfig;
use crate::embedding::http_client;
use crate::error::Result;
use crate::lock::LockManager;

/// A live Chroma client, plus the server process when this run started it.
#[derive(Debug)]
pub struct ChromaHandle {
    client: ChromaClient,
    server: Mutex<Option<BundledServer>>,
    bundled: bool,
}

impl ChromaHandle {
    #[must_use]
    pub fn client(&self) -> &ChromaClient {
        &self.client
    }

    /// Whether the server writes to a local data directory owned by this run.
    #[must_use]
    pub fn is_bundled(&self) -> bool {
        self.bundled
    }

    async fn shutdown(&self) {
        if let Some(mut server) = self.server.lock().await.take() {
            server.shutdown().await;
        }
    }
}

/// Per-run owner of backend clients, bundled servers and directory locks.
///
/// Create one per process run and call [`ClientRegistry::shutdown`] before exit.
#[derive(Debug)]
pub struct ClientRegistry {
    http: reqwest::Client,
    chroma: Mutex<HashMap<PathBuf, Arc<ChromaHandle>>>,
    locks: LockManager,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: http_client(),
            chroma: Mutex::new(HashMap::new()),
            locks: LockManager::new(),
        }
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Chroma client for the project, reusing a cached one. When `db_url` does
    /// not answer, a bundled server is started on `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundled server cannot be started.
    pub async fn chroma(&self, config: &StoreConfig) -> Result<Arc<ChromaHandle>> {
        let mut handles = self.chroma.lock().await;
        if let Some(handle) = handles.get(&config.project_root) {
            return Ok(Arc::clone(handle));
        }

        let handle = if try_server(&self.http, &config.db_url).await {
            tracing::debug!(url = %config.db_url, "using remote Chroma server");
            ChromaHandle {
                client: ChromaClient::new(self.http.clone(), &config.db_url),
                server: Mutex::new(None),
                bundled: false,
            }
        } else {
            let server = BundledServer::start(
                &self.http,
                &config.server_command,
                &config.db_path,
                &config.db_log_path,
                config.server_timeout,
            )
            .await?;
            ChromaHandle {
                client: ChromaClient::new(self.http.clone(), server.url()),
                server: Mutex::new(Some(server)),
                bundled: true,
            }
        };

        let handle = Arc::new(handle);
        handles.insert(config.project_root.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Stop every bundled server and forget all clients.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.chroma.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::test_support::store_config;

    #[tokio::test]
    async fn remote_client_is_cached_per_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/heartbeat"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = store_config(dir.path(), dir.path());
        config.db_url = server.uri();

        let registry = ClientRegistry::new();
        let first = registry.chroma(&config).await.unwrap();
        let second = registry.chroma(&config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.is_bundled());
        assert_eq!(first.client().base_url(), server.uri());

        registry.shutdown().await;
        let third = registry.chroma(&config).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn unreachable_url_without_server_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = store_config(dir.path(), &dir.path().join("db"));
        config.server_command = vec!["codevec-no-such-binary".into()];
        let registry = ClientRegistry::new();
        assert!(registry.chroma(&config).await.is_err());
    }
}
