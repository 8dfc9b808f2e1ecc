//! Named-blob storage contract and its OpenDAL implementation.
//!
//! Blob names are flat (no directories); the object store owns the naming
//! scheme. Blob contents are opaque ciphertext at this layer.

use async_trait::async_trait;
use bytes::Bytes;
use lbx_core::{LbxError, LbxResult};
use opendal::{EntryMode, ErrorKind, Operator};
use tracing::debug;

/// Read/write/list/delete of opaque named byte blobs.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// `NotFound` if the blob does not exist.
    async fn read_blob(&self, name: &str) -> LbxResult<Bytes>;

    /// Create or replace `name`.
    async fn write_blob(&self, name: &str, data: Bytes) -> LbxResult<()>;

    /// Remove `name`. Removing a missing blob is not an error.
    async fn delete_blob(&self, name: &str) -> LbxResult<()>;

    /// Names of every blob in the store, in no particular order.
    async fn list_blob_names(&self) -> LbxResult<Vec<String>>;

    async fn exists_blob(&self, name: &str) -> LbxResult<bool>;
}

/// `BlobStorage` over any OpenDAL operator.
#[derive(Clone)]
pub struct OpendalBlobStorage {
    op: Operator,
}

impl OpendalBlobStorage {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    /// Storage backed by a fresh in-memory operator.
    pub fn memory() -> LbxResult<Self> {
        Ok(Self::new(crate::operator::memory_operator()?))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

impl std::fmt::Debug for OpendalBlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpendalBlobStorage")
            .field("scheme", &self.op.info().scheme())
            .field("root", &self.op.info().root())
            .finish()
    }
}

fn map_err(action: &str, name: &str, e: opendal::Error) -> LbxError {
    if e.kind() == ErrorKind::NotFound {
        LbxError::NotFound(name.to_string())
    } else {
        LbxError::Storage(format!("{action} {name}: {e}"))
    }
}

#[async_trait]
impl BlobStorage for OpendalBlobStorage {
    async fn read_blob(&self, name: &str) -> LbxResult<Bytes> {
        let buf = self
            .op
            .read(name)
            .await
            .map_err(|e| map_err("reading", name, e))?;
        Ok(buf.to_bytes())
    }

    async fn write_blob(&self, name: &str, data: Bytes) -> LbxResult<()> {
        let len = data.len();
        self.op
            .write(name, data)
            .await
            .map_err(|e| map_err("writing", name, e))?;
        debug!(blob = %name, bytes = len, "blob written");
        Ok(())
    }

    async fn delete_blob(&self, name: &str) -> LbxResult<()> {
        self.op
            .delete(name)
            .await
            .map_err(|e| map_err("deleting", name, e))
    }

    async fn list_blob_names(&self) -> LbxResult<Vec<String>> {
        let entries = self
            .op
            .list("/")
            .await
            .map_err(|e| map_err("listing", "/", e))?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.metadata().mode() == EntryMode::FILE)
            .map(|entry| entry.name().to_string())
            .collect())
    }

    async fn exists_blob(&self, name: &str) -> LbxResult<bool> {
        self.op
            .exists(name)
            .await
            .map_err(|e| map_err("probing", name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::build_operator;
    use lbx_core::config::VaultConfig;

    async fn exercise(storage: &dyn BlobStorage) {
        storage
            .write_blob("a.enc", Bytes::from_static(b"alpha"))
            .await
            .unwrap();
        storage
            .write_blob("b.metadata.enc", Bytes::from_static(b"beta"))
            .await
            .unwrap();

        assert_eq!(storage.read_blob("a.enc").await.unwrap(), &b"alpha"[..]);
        assert!(storage.exists_blob("a.enc").await.unwrap());
        assert!(!storage.exists_blob("zzz.enc").await.unwrap());

        let mut names = storage.list_blob_names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a.enc", "b.metadata.enc"]);

        storage.delete_blob("a.enc").await.unwrap();
        assert!(storage.read_blob("a.enc").await.unwrap_err().is_not_found());
        // Deleting twice is fine
        storage.delete_blob("a.enc").await.unwrap();
    }

    #[tokio::test]
    async fn memory_backend_contract() {
        exercise(&OpendalBlobStorage::memory().unwrap()).await;
    }

    #[tokio::test]
    async fn fs_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        let op = build_operator(&VaultConfig {
            backend: "fs".into(),
            root: dir.path().to_path_buf(),
        })
        .unwrap();
        exercise(&OpendalBlobStorage::new(op)).await;
    }

    #[tokio::test]
    async fn overwrite_replaces_contents() {
        let storage = OpendalBlobStorage::memory().unwrap();
        storage.write_blob("x.enc", Bytes::from_static(b"one")).await.unwrap();
        storage.write_blob("x.enc", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(storage.read_blob("x.enc").await.unwrap(), &b"two"[..]);
    }
}
