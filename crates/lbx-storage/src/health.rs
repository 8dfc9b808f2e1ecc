//! Storage health check

use lbx_core::LbxResult;

use crate::blob::BlobStorage;

/// Verify the blob store is reachable by listing it. Returns the blob count.
pub async fn check_health(storage: &dyn BlobStorage) -> LbxResult<usize> {
    storage.list_blob_names().await.map(|names| names.len())
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(storage: &dyn BlobStorage) -> bool {
    check_health(storage).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::OpendalBlobStorage;

    #[tokio::test]
    async fn memory_storage_is_healthy() {
        let storage = OpendalBlobStorage::memory().unwrap();
        storage.write_blob("a.enc", b"x".to_vec().into()).await.unwrap();
        assert_eq!(check_health(&storage).await.unwrap(), 1);
        assert!(is_healthy(&storage).await);
    }
}
