//! `Vault`: the application-facing API over store, cache and sessions.
//!
//! One `Vault` per open vault directory. Clones share everything.

use std::sync::Arc;

use bytes::Bytes;
use lbx_core::config::{LbxConfig, StreamingConfig};
use lbx_core::{LbxError, LbxResult, Layout, ObjectId, ObjectMetadata};
use lbx_crypto::{CryptoProvider, EncryptionKey, KdfParams, SoftwareCrypto};
use lbx_storage::{BlobStorage, OpendalBlobStorage};
use lbx_store::{DeleteReport, ListFilter, ObjectStore, SaveRequest, StoreOptions};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheStats, ChunkCache};
use crate::progressive::{ProgressiveLoader, ProgressiveOptions, ProgressiveStream};
use crate::session::StreamingSessionManager;

#[derive(Clone)]
pub struct Vault {
    storage: Arc<dyn BlobStorage>,
    crypto: Arc<dyn CryptoProvider>,
    store: ObjectStore,
    sessions: Arc<StreamingSessionManager>,
    kdf: KdfParams,
    streaming: StreamingConfig,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("store", &self.store)
            .field("sessions", &self.sessions)
            .field("kdf_iterations", &self.kdf.iterations)
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Open the vault described by `cfg`, creating an `fs` root if needed.
    pub fn open(cfg: &LbxConfig) -> LbxResult<Self> {
        let op = lbx_storage::build_operator(&cfg.vault)?;
        Ok(Self::with_storage(Arc::new(OpendalBlobStorage::new(op)), cfg))
    }

    pub fn with_storage(storage: Arc<dyn BlobStorage>, cfg: &LbxConfig) -> Self {
        Self::with_parts(storage, Arc::new(SoftwareCrypto), cfg)
    }

    pub fn with_parts(
        storage: Arc<dyn BlobStorage>,
        crypto: Arc<dyn CryptoProvider>,
        cfg: &LbxConfig,
    ) -> Self {
        let store = ObjectStore::with_crypto(
            Arc::clone(&storage),
            Arc::clone(&crypto),
            StoreOptions::from(&cfg.chunking),
        );
        let cache = Arc::new(ChunkCache::from_config(&cfg.cache));
        let sessions = Arc::new(StreamingSessionManager::new(store.clone(), cache));
        Self {
            storage,
            crypto,
            store,
            sessions,
            kdf: KdfParams::with_iterations(cfg.crypto.kdf_iterations),
            streaming: cfg.streaming.clone(),
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<StreamingSessionManager> {
        &self.sessions
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        self.sessions.cache()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }

    /// PBKDF2 with the configured iteration count, run on the blocking pool.
    pub async fn derive_key(&self, password: &SecretString, salt: &[u8]) -> LbxResult<EncryptionKey> {
        let crypto = Arc::clone(&self.crypto);
        let password = SecretString::from(password.expose_secret().to_owned());
        let salt = salt.to_vec();
        let params = self.kdf;
        tokio::task::spawn_blocking(move || crypto.derive_key(&password, &salt, &params))
            .await
            .map_err(|e| LbxError::from(anyhow::anyhow!("key derivation task failed: {e}")))?
    }

    pub async fn save_object(
        &self,
        plaintext: Bytes,
        req: SaveRequest,
        key: &EncryptionKey,
    ) -> LbxResult<ObjectMetadata> {
        self.store.save(plaintext, req, key).await
    }

    /// Whole plaintext plus metadata, through the whole-object cache.
    pub async fn load_object(
        &self,
        id: &ObjectId,
        key: &EncryptionKey,
        cancel: Option<&CancellationToken>,
    ) -> LbxResult<(Bytes, ObjectMetadata)> {
        let meta = self.store.load_metadata(id, key).await?;
        if let Some(data) = self.cache().get(&CacheKey::Object(*id)) {
            debug!(%id, "object served from cache");
            return Ok((data, meta));
        }
        let generation = self.cache().generation(id);
        let (data, meta) = self.store.load(id, key, cancel).await?;
        self.cache()
            .put_if_current(CacheKey::Object(*id), data.clone(), generation);
        Ok((data, meta))
    }

    pub async fn load_metadata(&self, id: &ObjectId, key: &EncryptionKey) -> LbxResult<ObjectMetadata> {
        self.store.load_metadata(id, key).await
    }

    pub async fn load_preview(&self, id: &ObjectId, key: &EncryptionKey) -> Option<Bytes> {
        self.store.load_preview(id, key).await
    }

    pub async fn exists(&self, id: &ObjectId) -> LbxResult<bool> {
        self.store.exists(id).await
    }

    /// Delete every blob of `id`, close its session and drop cached data.
    pub async fn delete_object(&self, id: &ObjectId) -> LbxResult<DeleteReport> {
        self.sessions.close(id);
        let purged = self.cache().remove_object(id);
        let report = self.store.delete(id).await?;
        debug!(%id, purged, "cache entries purged");
        Ok(report)
    }

    pub async fn update_metadata<F>(
        &self,
        id: &ObjectId,
        key: &EncryptionKey,
        f: F,
    ) -> LbxResult<ObjectMetadata>
    where
        F: FnOnce(&mut ObjectMetadata),
    {
        self.store.update_metadata(id, key, f).await
    }

    pub async fn list_objects(
        &self,
        key: &EncryptionKey,
        filter: &ListFilter,
    ) -> LbxResult<Vec<ObjectMetadata>> {
        self.store.list(key, filter).await
    }

    /// Default progressive options from the `[streaming]` config section.
    pub fn progressive_options(&self) -> ProgressiveOptions {
        ProgressiveOptions::from(&self.streaming)
    }

    /// Start progressive decryption of `id`; see [`ProgressiveLoader`].
    pub async fn open_progressive_stream(
        &self,
        id: &ObjectId,
        key: &EncryptionKey,
        opts: ProgressiveOptions,
    ) -> LbxResult<ProgressiveStream> {
        ProgressiveLoader::start(
            Arc::clone(&self.sessions),
            *id,
            key,
            opts,
            CancellationToken::new(),
        )
        .await
    }

    /// End the streaming session of `id`; running loads and prefetches stop
    /// at their next batch boundary.
    pub fn close_stream(&self, id: &ObjectId) -> bool {
        self.sessions.close(id)
    }

    /// Plaintext bytes `start..end` of `id` (end exclusive).
    ///
    /// For chunked objects the chunks after the range are then prefetched
    /// in the background, `prefetch_ahead` of them.
    pub async fn get_chunk_range(
        &self,
        id: &ObjectId,
        start: u64,
        end: u64,
        key: &EncryptionKey,
    ) -> LbxResult<Bytes> {
        let data = self.sessions.get_range(id, start, end, key).await?;

        let ahead = self.streaming.prefetch_ahead;
        if ahead > 0 && start < end {
            let meta = self.sessions.open(id, key).await?;
            if let Layout::Chunked { chunk_size, .. } = meta.layout {
                let next = u32::try_from(end.div_ceil(chunk_size)).unwrap_or(u32::MAX);
                let sessions = Arc::clone(&self.sessions);
                let id = *id;
                tokio::spawn(async move {
                    if let Err(e) = sessions.prefetch(&id, next, ahead).await {
                        debug!(%id, error = %e, "prefetch skipped");
                    }
                });
            }
        }
        Ok(data)
    }

    /// Probe the blob store. Returns the number of blobs.
    pub async fn health(&self) -> LbxResult<usize> {
        let count = lbx_storage::check_health(self.storage.as_ref()).await?;
        info!(blobs = count, "vault storage healthy");
        Ok(count)
    }
}
