//! Vector-store connectors for code indexes.
//!
//! A [`StoreConnector`] hides one backend behind the operations the indexing
//! and query pipelines need. Collections are addressed by an id derived from
//! the user, host and project path, so no separate name registry is kept.
//! Live clients, bundled server processes and directory locks are owned by an
//! explicit [`ClientRegistry`] created per run.

pub mod backend;
pub mod chroma;
pub mod config;
pub mod connector;
pub mod embedding;
pub mod error;
pub mod identity;
pub mod local;
pub mod lock;
pub mod registry;
pub mod types;

pub use backend::{BackendRegistry, ConnectorFactory};
pub use chroma::ChromaConnector;
pub use config::StoreConfig;
pub use connector::{
    BoxFuture, StoreConnector, check_orphans, cleanup, count, verify_embedding_function,
};
pub use embedding::{EmbeddingFunction, EmbeddingParams, HashingEmbedding, resolve_embedding};
pub use error::{Result, StoreError};
pub use identity::{collection_id, hash_file};
pub use local::LocalConnector;
pub use registry::ClientRegistry;
pub use types::{
    CollectionContent, CollectionInfo, IndexedFile, QueryOptions, QueryResult, ResultType,
    VectoriseStats,
};
