use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chroma::ChromaConnector;
use crate::config::StoreConfig;
use crate::connector::{BoxFuture, StoreConnector};
use crate::error::{Result, StoreError};
use crate::local::LocalConnector;
use crate::registry::ClientRegistry;

pub type ConnectorFactory =
    fn(StoreConfig, Arc<ClientRegistry>) -> BoxFuture<'static, Result<Box<dyn StoreConnector>>>;

/// Maps a backend tag to its connector factory.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: BTreeMap<&'static str, ConnectorFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("chroma", chroma_factory);
        registry.register("local", local_factory);
        registry
    }
}

fn chroma_factory(
    config: StoreConfig,
    clients: Arc<ClientRegistry>,
) -> BoxFuture<'static, Result<Box<dyn StoreConnector>>> {
    Box::pin(async move {
        let connector = ChromaConnector::connect(config, clients).await?;
        Ok(Box::new(connector) as Box<dyn StoreConnector>)
    })
}

fn local_factory(
    config: StoreConfig,
    clients: Arc<ClientRegistry>,
) -> BoxFuture<'static, Result<Box<dyn StoreConnector>>> {
    Box::pin(async move { Ok(Box::new(LocalConnector::new(config, clients)) as Box<dyn StoreConnector>) })
}

impl BackendRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tag: &'static str, factory: ConnectorFactory) {
        self.factories.insert(tag, factory);
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Look up a backend tag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownBackend`] for unregistered tags.
    pub fn resolve(&self, tag: &str) -> Result<ConnectorFactory> {
        self.factories
            .get(tag)
            .copied()
            .ok_or_else(|| StoreError::UnknownBackend(tag.to_owned()))
    }

    /// Resolve `tag` and build its connector.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tags or when the backend cannot be reached.
    pub async fn connect(
        &self,
        tag: &str,
        config: StoreConfig,
        clients: Arc<ClientRegistry>,
    ) -> Result<Box<dyn StoreConnector>> {
        let factory = self.resolve(tag)?;
        tracing::debug!(backend = tag, "connecting");
        factory(config, clients).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::store_config;

    #[test]
    fn default_backends_are_registered() {
        let registry = BackendRegistry::default();
        assert_eq!(registry.names(), ["chroma", "local"]);
        assert!(registry.resolve("local").is_ok());
    }

    #[test]
    fn unknown_backend_is_config_error() {
        let err = BackendRegistry::default().resolve("pgvector").unwrap_err();
        assert!(matches!(err, StoreError::UnknownBackend(ref tag) if tag == "pgvector"));
    }

    #[tokio::test]
    async fn connect_local() {
        let dir = tempfile::tempdir().unwrap();
        let connector = BackendRegistry::default()
            .connect(
                "local",
                store_config(dir.path(), dir.path()),
                Arc::new(ClientRegistry::new()),
            )
            .await
            .unwrap();
        assert_eq!(connector.backend_name(), "local");
    }
}
