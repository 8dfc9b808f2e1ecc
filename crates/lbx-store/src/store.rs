//! ObjectStore: encrypted payload, metadata and preview blobs over an
//! injected [`BlobStorage`].
//!
//! Write order on save is payload, preview, metadata. An object whose
//! metadata blob is missing is invisible to `list`, so a crash mid-save
//! leaves orphans but never a half-readable object.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use lbx_core::config::{ChunkingConfig, DEFAULT_CHUNK_SIZE};
use lbx_core::{LbxError, LbxResult, Layout, ObjectId, ObjectMetadata};
use lbx_crypto::chunk::{encrypt_chunked_with, reassemble};
use lbx_crypto::{CryptoProvider, EncryptionKey, SoftwareCrypto};
use lbx_storage::BlobStorage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metadata::MetadataRecord;
use crate::names::{self, BlobKind};

/// Blob reads/writes kept in flight at once for one object.
const IO_CONCURRENCY: usize = 4;

/// Layout selection knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub chunk_size: u64,
    /// Non-video objects at or above this size are chunked.
    pub chunk_threshold: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_threshold: 10 * DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&ChunkingConfig> for StoreOptions {
    fn from(cfg: &ChunkingConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size,
            chunk_threshold: cfg.chunk_threshold,
        }
    }
}

/// Descriptive fields supplied by the caller on save.
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub name: String,
    pub mime_type: String,
    pub folder_path: Vec<String>,
    pub tags: BTreeSet<String>,
    /// Pre-rendered preview bytes; stored for images only
    pub preview: Option<Bytes>,
}

impl SaveRequest {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            ..Default::default()
        }
    }

    pub fn folder<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.folder_path = segments.into_iter().map(Into::into).collect();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn preview(mut self, preview: impl Into<Bytes>) -> Self {
        self.preview = Some(preview.into());
        self
    }
}

/// Outcome of a best-effort delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub removed: Vec<String>,
    /// Blob name and the error that kept it alive
    pub failed: Vec<(String, String)>,
}

impl DeleteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Post-decryption filter for [`ObjectStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub folder_prefix: Option<Vec<String>>,
    pub tag: Option<String>,
}

impl ListFilter {
    pub fn matches(&self, meta: &ObjectMetadata) -> bool {
        if let Some(prefix) = &self.folder_prefix {
            if !meta.in_folder(prefix) {
                return false;
            }
        }
        match &self.tag {
            Some(tag) => meta.tags.contains(tag),
            None => true,
        }
    }
}

/// Encrypted object store.
///
/// Cheap to clone; clones share the storage and crypto provider.
#[derive(Clone)]
pub struct ObjectStore {
    storage: Arc<dyn BlobStorage>,
    crypto: Arc<dyn CryptoProvider>,
    options: StoreOptions,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ObjectStore {
    pub fn new(storage: Arc<dyn BlobStorage>, options: StoreOptions) -> Self {
        Self::with_crypto(storage, Arc::new(SoftwareCrypto), options)
    }

    pub fn with_crypto(
        storage: Arc<dyn BlobStorage>,
        crypto: Arc<dyn CryptoProvider>,
        options: StoreOptions,
    ) -> Self {
        Self {
            storage,
            crypto,
            options,
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn storage(&self) -> &Arc<dyn BlobStorage> {
        &self.storage
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    fn choose_layout(&self, size: u64, mime_type: &str) -> LbxResult<Layout> {
        let video = mime_type.starts_with("video/");
        if !video && size < self.options.chunk_threshold {
            return Ok(Layout::Single);
        }
        let chunk_size = self.options.chunk_size;
        Ok(Layout::Chunked {
            chunk_size,
            chunk_count: lbx_crypto::chunk::chunk_count(size, chunk_size)?,
            original_size: size,
        })
    }

    /// Encrypt and persist a new object.
    ///
    /// Video is always chunked; anything else is chunked from
    /// `chunk_threshold` bytes up. On a write failure the blobs already
    /// written are removed best-effort before the error is returned.
    pub async fn save(
        &self,
        plaintext: Bytes,
        req: SaveRequest,
        key: &EncryptionKey,
    ) -> LbxResult<ObjectMetadata> {
        if req.name.trim().is_empty() {
            return Err(LbxError::InvalidInput("object name must not be empty".into()));
        }

        let id = Uuid::new_v4();
        let size = plaintext.len() as u64;
        let mime_type = if req.mime_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            req.mime_type
        };
        let layout = self.choose_layout(size, &mime_type)?;

        let preview = match req.preview {
            Some(p) if mime_type.starts_with("image/") => Some(p),
            Some(_) => {
                debug!(%id, mime = %mime_type, "preview ignored for non-image object");
                None
            }
            None => None,
        };

        let now = Utc::now();
        let meta = ObjectMetadata {
            id,
            display_name: req.name,
            mime_type,
            size,
            folder_path: req.folder_path,
            tags: req.tags,
            // Metadata records carry millisecond precision
            created_at: DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now),
            layout,
            has_preview: preview.is_some(),
        };

        if let Err(e) = self.write_object(&meta, plaintext, preview, key).await {
            warn!(%id, error = %e, "save failed, removing partial blobs");
            self.remove_canonical(&id, &layout).await;
            return Err(e);
        }

        info!(
            %id,
            name = %meta.display_name,
            bytes = size,
            chunks = layout.blob_count(),
            chunked = layout.is_chunked(),
            "object saved"
        );
        Ok(meta)
    }

    async fn write_object(
        &self,
        meta: &ObjectMetadata,
        plaintext: Bytes,
        preview: Option<Bytes>,
        key: &EncryptionKey,
    ) -> LbxResult<()> {
        let id = meta.id;
        match meta.layout {
            Layout::Single => {
                let blob = self.encrypt_blocking(plaintext, key).await?;
                self.storage
                    .write_blob(&names::payload_name(&id), Bytes::from(blob))
                    .await?;
            }
            Layout::Chunked { chunk_size, .. } => {
                let crypto = Arc::clone(&self.crypto);
                let key = key.clone();
                let blobs = tokio::task::spawn_blocking(move || {
                    encrypt_chunked_with(crypto.as_ref(), &plaintext, &key, chunk_size)
                })
                .await
                .map_err(join_error)??;

                let storage = &self.storage;
                stream::iter(blobs.into_iter().enumerate())
                    .map(|(index, blob)| async move {
                        let name = names::chunk_name(&id, index as u32);
                        storage.write_blob(&name, Bytes::from(blob)).await
                    })
                    .buffer_unordered(IO_CONCURRENCY)
                    .try_collect::<Vec<()>>()
                    .await?;
            }
        }

        if let Some(preview) = preview {
            let blob = self.encrypt_blocking(preview, key).await?;
            self.storage
                .write_blob(&names::preview_name(&id), Bytes::from(blob))
                .await?;
        }

        self.write_metadata(meta, key).await
    }

    async fn write_metadata(&self, meta: &ObjectMetadata, key: &EncryptionKey) -> LbxResult<()> {
        let json = MetadataRecord::from_metadata(meta).to_bytes()?;
        let blob = self.crypto.encrypt(&json, key)?;
        self.storage
            .write_blob(&names::metadata_name(&meta.id), Bytes::from(blob))
            .await
    }

    async fn encrypt_blocking(&self, plaintext: Bytes, key: &EncryptionKey) -> LbxResult<Vec<u8>> {
        let crypto = Arc::clone(&self.crypto);
        let key = key.clone();
        tokio::task::spawn_blocking(move || crypto.encrypt(&plaintext, &key))
            .await
            .map_err(join_error)?
    }

    async fn decrypt_blocking(
        &self,
        blob: Bytes,
        key: &EncryptionKey,
        context: String,
    ) -> LbxResult<Vec<u8>> {
        let crypto = Arc::clone(&self.crypto);
        let key = key.clone();
        tokio::task::spawn_blocking(move || {
            crypto.decrypt(&blob, &key).map_err(|e| e.with_context(context))
        })
        .await
        .map_err(join_error)?
    }

    async fn read_object_blob(&self, id: &ObjectId, name: &str) -> LbxResult<Bytes> {
        self.storage.read_blob(name).await.map_err(|e| match e {
            LbxError::NotFound(_) => LbxError::NotFound(format!("{name} (object {id})")),
            other => other,
        })
    }

    /// Decrypt the metadata blob only; the payload is not touched.
    pub async fn load_metadata(&self, id: &ObjectId, key: &EncryptionKey) -> LbxResult<ObjectMetadata> {
        let blob = self.read_object_blob(id, &names::metadata_name(id)).await?;
        let json = self
            .crypto
            .decrypt(&blob, key)
            .map_err(|e| e.with_context(format!("metadata of {id}")))?;
        MetadataRecord::from_bytes(&json)?.into_metadata(Some(*id))
    }

    /// Decrypt a single-layout payload.
    pub async fn load_payload(&self, id: &ObjectId, key: &EncryptionKey) -> LbxResult<Bytes> {
        let blob = self.read_object_blob(id, &names::payload_name(id)).await?;
        let plain = self
            .decrypt_blocking(blob, key, format!("payload of {id}"))
            .await?;
        Ok(Bytes::from(plain))
    }

    /// Read and decrypt one chunk blob.
    pub async fn load_chunk(&self, id: &ObjectId, index: u32, key: &EncryptionKey) -> LbxResult<Bytes> {
        let blob = self
            .read_object_blob(id, &names::chunk_name(id, index))
            .await?;
        let plain = self
            .decrypt_blocking(blob, key, format!("chunk {index} of {id}"))
            .await?;
        debug!(%id, chunk = index, bytes = plain.len(), "chunk decrypted");
        Ok(Bytes::from(plain))
    }

    /// Load and decrypt a whole object.
    ///
    /// Chunked payloads are fetched in batches; `cancel` is checked between
    /// batches and yields `Cancelled` once observed.
    pub async fn load(
        &self,
        id: &ObjectId,
        key: &EncryptionKey,
        cancel: Option<&CancellationToken>,
    ) -> LbxResult<(Bytes, ObjectMetadata)> {
        let meta = self.load_metadata(id, key).await?;
        let data = match meta.layout {
            Layout::Single => {
                let data = self.load_payload(id, key).await?;
                if data.len() as u64 != meta.size {
                    return Err(LbxError::SizeMismatch {
                        expected: meta.size,
                        actual: data.len() as u64,
                    });
                }
                data
            }
            Layout::Chunked {
                chunk_count,
                original_size,
                ..
            } => {
                let mut chunks = Vec::with_capacity(chunk_count as usize);
                let indices: Vec<u32> = (0..chunk_count).collect();
                for batch in indices.chunks(IO_CONCURRENCY) {
                    if cancel.is_some_and(CancellationToken::is_cancelled) {
                        debug!(%id, loaded = chunks.len(), "load cancelled");
                        return Err(LbxError::Cancelled);
                    }
                    let loaded = futures::future::try_join_all(
                        batch.iter().map(|&index| async move {
                            Ok::<_, LbxError>((index, self.load_chunk(id, index, key).await?))
                        }),
                    )
                    .await?;
                    chunks.extend(loaded);
                    tokio::task::yield_now().await;
                }
                Bytes::from(reassemble(chunks, original_size)?)
            }
        };
        debug!(%id, bytes = data.len(), "object loaded");
        Ok((data, meta))
    }

    /// Decrypted preview, or `None` when absent or unreadable.
    pub async fn load_preview(&self, id: &ObjectId, key: &EncryptionKey) -> Option<Bytes> {
        let name = names::preview_name(id);
        let blob = match self.storage.read_blob(&name).await {
            Ok(blob) => blob,
            Err(LbxError::NotFound(_)) => return None,
            Err(e) => {
                warn!(%id, error = %e, "preview unreadable");
                return None;
            }
        };
        match self.crypto.decrypt(&blob, key) {
            Ok(plain) => Some(Bytes::from(plain)),
            Err(e) => {
                warn!(%id, error = %e, "preview failed to decrypt");
                None
            }
        }
    }

    /// True if the object's metadata blob exists.
    pub async fn exists(&self, id: &ObjectId) -> LbxResult<bool> {
        self.storage.exists_blob(&names::metadata_name(id)).await
    }

    /// Every blob name belonging to `id`, metadata first.
    async fn blobs_of(&self, id: &ObjectId) -> LbxResult<Vec<String>> {
        let mut owned: Vec<(u8, u32, String)> = self
            .storage
            .list_blob_names()
            .await?
            .into_iter()
            .filter_map(|name| match names::parse_blob_name(&name) {
                Some((owner, kind)) if owner == *id => {
                    let rank = match kind {
                        BlobKind::Metadata => (0, 0),
                        BlobKind::Preview => (1, 0),
                        BlobKind::Payload => (2, 0),
                        BlobKind::Chunk(index) => (3, index),
                    };
                    Some((rank.0, rank.1, name))
                }
                _ => None,
            })
            .collect();
        owned.sort();
        Ok(owned.into_iter().map(|(_, _, name)| name).collect())
    }

    /// Remove every blob of an object, each independently.
    ///
    /// The metadata blob goes first so a partially deleted object drops out
    /// of listings. Individual failures are logged and reported, never
    /// raised. `NotFound` only when nothing for `id` exists.
    pub async fn delete(&self, id: &ObjectId) -> LbxResult<DeleteReport> {
        let blobs = match self.blobs_of(id).await {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(%id, error = %e, "blob listing failed, probing canonical names");
                let mut probed = Vec::new();
                for name in [names::metadata_name(id), names::preview_name(id), names::payload_name(id)] {
                    if self.storage.exists_blob(&name).await.unwrap_or(false) {
                        probed.push(name);
                    }
                }
                probed
            }
        };
        if blobs.is_empty() {
            return Err(LbxError::NotFound(format!("object {id}")));
        }

        let mut report = DeleteReport::default();
        for name in blobs {
            match self.storage.delete_blob(&name).await {
                Ok(()) => report.removed.push(name),
                Err(e) => {
                    warn!(%id, blob = %name, error = %e, "blob delete failed, continuing");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        info!(
            %id,
            removed = report.removed.len(),
            failed = report.failed.len(),
            "object deleted"
        );
        Ok(report)
    }

    /// Best-effort removal of the blobs a save would have written.
    async fn remove_canonical(&self, id: &ObjectId, layout: &Layout) {
        let mut blobs = vec![names::metadata_name(id), names::preview_name(id)];
        match layout {
            Layout::Single => blobs.push(names::payload_name(id)),
            Layout::Chunked { chunk_count, .. } => {
                blobs.extend((0..*chunk_count).map(|i| names::chunk_name(id, i)))
            }
        }
        for name in blobs {
            if let Err(e) = self.storage.delete_blob(&name).await {
                debug!(%id, blob = %name, error = %e, "cleanup delete failed");
            }
        }
    }

    /// Decrypt every metadata blob readable with `key`.
    ///
    /// Entries that fail to read, decrypt or parse are skipped with a
    /// warning. Newest first.
    pub async fn list(&self, key: &EncryptionKey, filter: &ListFilter) -> LbxResult<Vec<ObjectMetadata>> {
        let ids: Vec<ObjectId> = self
            .storage
            .list_blob_names()
            .await?
            .iter()
            .filter_map(|name| names::parse_metadata_name(name))
            .collect();

        let mut objects: Vec<ObjectMetadata> = stream::iter(ids)
            .map(|id| async move { (id, self.load_metadata(&id, key).await) })
            .buffer_unordered(IO_CONCURRENCY)
            .filter_map(|(id, result)| async move {
                match result {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        warn!(%id, error = %e, "skipping unreadable metadata");
                        None
                    }
                }
            })
            .filter(|meta| std::future::ready(filter.matches(meta)))
            .collect()
            .await;

        objects.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        debug!(count = objects.len(), "objects listed");
        Ok(objects)
    }

    /// Apply `f` to an object's metadata and re-encrypt it.
    ///
    /// Only the descriptive fields (name, mime type, folder, tags) may
    /// change; edits to anything else are discarded.
    pub async fn update_metadata<F>(
        &self,
        id: &ObjectId,
        key: &EncryptionKey,
        f: F,
    ) -> LbxResult<ObjectMetadata>
    where
        F: FnOnce(&mut ObjectMetadata),
    {
        let current = self.load_metadata(id, key).await?;
        let mut edited = current.clone();
        f(&mut edited);

        let updated = ObjectMetadata {
            display_name: edited.display_name,
            mime_type: edited.mime_type,
            folder_path: edited.folder_path,
            tags: edited.tags,
            ..current
        };
        if updated.display_name.trim().is_empty() {
            return Err(LbxError::InvalidInput("object name must not be empty".into()));
        }
        self.write_metadata(&updated, key).await?;
        info!(%id, name = %updated.display_name, "metadata updated");
        Ok(updated)
    }
}

fn join_error(e: tokio::task::JoinError) -> LbxError {
    LbxError::from(anyhow::anyhow!("crypto task failed: {e}"))
}
