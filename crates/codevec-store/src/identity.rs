//! Collection identity: deterministic ids, ownership metadata and file digests.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::types::Metadata;

/// Value of the `created-by` metadata field on collections this tool creates.
pub const CREATED_BY: &str = "codevec";

/// Metadata fields that tie a collection to its owner. A mismatch on any of
/// them means two projects hashed to the same id.
pub const IDENTITY_FIELDS: [&str; 4] = ["path", "hostname", "created-by", "username"];

/// Deterministic collection id: first 63 hex chars of
/// `sha256("{user}@{hostname}:{project_path}")`.
#[must_use]
pub fn collection_id(user: &str, hostname: &str, project_path: &str) -> String {
    let digest = Sha256::digest(format!("{user}@{hostname}:{project_path}").as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(63);
    id
}

/// Collection id for a project owned by the current user on this host.
#[must_use]
pub fn project_collection_id(project_root: &Path) -> String {
    collection_id(
        &current_user(),
        &current_hostname(),
        &project_root.to_string_lossy(),
    )
}

#[must_use]
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "DEFAULT_USER".to_owned())
}

#[must_use]
pub fn current_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Streaming sha256 of a file, hex encoded.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`hash_file`] on the blocking pool.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn hash_file_async(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

/// Metadata written on collection creation.
#[must_use]
pub fn collection_metadata(config: &StoreConfig) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(
        "path".into(),
        config.project_root.to_string_lossy().into_owned().into(),
    );
    meta.insert("hostname".into(), current_hostname().into());
    meta.insert("created-by".into(), CREATED_BY.into());
    meta.insert("username".into(), current_user().into());
    meta.insert(
        "embedding_function".into(),
        config.embedding.name().to_owned().into(),
    );
    for (key, value) in config.hnsw_metadata() {
        meta.insert(key, value);
    }
    meta
}

/// Compare `fields` of `expected` against the metadata the backend stored.
///
/// # Errors
///
/// Returns [`StoreError::MetadataMismatch`] on the first differing field.
pub fn verify_metadata<'a>(
    expected: &Metadata,
    actual: &Metadata,
    fields: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    for field in fields {
        let want = expected.get(field);
        let got = actual.get(field);
        if want != got {
            return Err(StoreError::MetadataMismatch {
                field: field.to_owned(),
                expected: want.map_or_else(|| "nothing".into(), ToString::to_string),
                actual: got.map_or_else(|| "nothing".into(), ToString::to_string),
            });
        }
    }
    Ok(())
}

/// Whether a collection's metadata marks it as owned by this user on this host.
#[must_use]
pub fn owned_by_current_user(meta: &Metadata) -> bool {
    meta.get("created-by").and_then(|v| v.as_str()) == Some(CREATED_BY)
        && meta.get("username").and_then(|v| v.as_str()) == Some(current_user().as_str())
        && meta.get("hostname").and_then(|v| v.as_str()) == Some(current_hostname().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_id_is_deterministic() {
        let a = collection_id("alice", "box", "/repo");
        let b = collection_id("alice", "box", "/repo");
        assert_eq!(a, b);
        assert_eq!(a.len(), 63);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn collection_id_is_sha256_prefix() {
        let full = hex::encode(Sha256::digest(b"alice@box:/repo"));
        assert_eq!(collection_id("alice", "box", "/repo"), full[..63]);
    }

    #[test]
    fn collection_id_differs_per_project() {
        assert_ne!(
            collection_id("alice", "box", "/repo"),
            collection_id("alice", "box", "/other")
        );
        assert_ne!(
            collection_id("alice", "box", "/repo"),
            collection_id("bob", "box", "/repo")
        );
    }

    #[test]
    fn hash_file_matches_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "hello").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn hash_file_async_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(hash_file_async(&dir.path().join("missing")).await.is_err());
    }

    #[test]
    fn verify_metadata_detects_mismatch() {
        let mut expected = Metadata::new();
        expected.insert("username".into(), "alice".into());
        expected.insert("hostname".into(), "box".into());
        let mut actual = expected.clone();
        assert!(verify_metadata(&expected, &actual, ["username", "hostname"]).is_ok());

        actual.insert("hostname".into(), "other".into());
        let err = verify_metadata(&expected, &actual, ["username", "hostname"]).unwrap_err();
        assert!(matches!(err, StoreError::MetadataMismatch { ref field, .. } if field == "hostname"));
    }

    #[test]
    fn metadata_carries_ownership_and_hnsw() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::test_support::store_config(dir.path(), dir.path());
        let meta = collection_metadata(&config);
        assert_eq!(meta["created-by"], CREATED_BY);
        assert_eq!(meta["embedding_function"], "hashing");
        assert_eq!(meta["hnsw:M"], 64);
        assert!(owned_by_current_user(&meta));
    }
}
