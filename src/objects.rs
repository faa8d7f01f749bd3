//! Storage for original uploaded bytes, addressed by document id.
//!
//! The pipeline never owns bytes itself: upload writes them here, and a
//! reprocess run reads them back and checks them against the SHA-256
//! recorded on the document.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, document_id: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, document_id: &str) -> Result<Vec<u8>>;
}

/// SHA-256 of `bytes`, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Ids become file names, so only a conservative alphabet is accepted.
fn check_id(document_id: &str) -> Result<()> {
    if document_id.is_empty()
        || !document_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid object id: {:?}", document_id);
    }
    Ok(())
}

/// One file per document under a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, document_id: &str) -> Result<PathBuf> {
        check_id(document_id)?;
        Ok(self.root.join(format!("{}.bin", document_id)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, document_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(document_id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create storage dir: {}", self.root.display()))?;

        // Write then rename so a reader never sees a half-written object.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write object: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to store object: {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(document_id)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read object: {}", path.display()))
    }
}

/// Process-local object store for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, document_id: &str, bytes: &[u8]) -> Result<()> {
        check_id(document_id)?;
        self.objects
            .write()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?
            .insert(document_id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?
            .get(document_id)
            .cloned()
            .with_context(|| format!("object not found: {}", document_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn fs_store_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsObjectStore::new(tmp.path().join("objects"));
        store.put("doc-1", b"hello").await.unwrap();
        assert_eq!(store.get("doc-1").await.unwrap(), b"hello");
        assert!(store.get("doc-2").await.is_err());
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsObjectStore::new(tmp.path());
        assert!(store.put("../escape", b"x").await.is_err());
        assert!(MemoryObjectStore::new().put("a/b", b"x").await.is_err());
    }
}
