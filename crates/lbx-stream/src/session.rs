//! Streaming sessions: on-demand chunk and byte-range access to one object.
//!
//! A session pins an object's metadata and key, tracks which chunks it has
//! served, and owns a cancellation token that `close` fires. Chunk reads go
//! through the shared [`ChunkCache`] and [`SingleFlight`], so a foreground
//! seek and a background prefetch never decrypt the same chunk twice.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use lbx_core::{LbxError, LbxResult, Layout, ObjectId, ObjectMetadata};
use lbx_crypto::chunk::covering_chunks;
use lbx_crypto::EncryptionKey;
use lbx_store::ObjectStore;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ChunkCache};
use crate::singleflight::SingleFlight;

struct Session {
    meta: ObjectMetadata,
    key: EncryptionKey,
    resident: Mutex<BTreeSet<u32>>,
    cancel: CancellationToken,
    published_len: AtomicU64,
}

impl Session {
    /// Number of addressable chunks; a single-layout object is one chunk.
    fn chunk_count(&self) -> u32 {
        match self.meta.layout {
            Layout::Single => 1,
            Layout::Chunked { chunk_count, .. } => chunk_count,
        }
    }
}

/// Coordinates chunk access across concurrent callers.
pub struct StreamingSessionManager {
    store: ObjectStore,
    flights: SingleFlight,
    sessions: Mutex<HashMap<ObjectId, Arc<Session>>>,
}

impl std::fmt::Debug for StreamingSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSessionManager")
            .field("sessions", &self.sessions.lock().len())
            .field("flights", &self.flights)
            .finish()
    }
}

impl StreamingSessionManager {
    pub fn new(store: ObjectStore, cache: Arc<ChunkCache>) -> Self {
        Self {
            store,
            flights: SingleFlight::new(cache),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        self.flights.cache()
    }

    /// Chunk loads actually started (cache misses not joined to a flight).
    pub fn decrypts_started(&self) -> u64 {
        self.flights.started()
    }

    /// Open (or reuse) the session for `id`, reading its metadata.
    pub async fn open(&self, id: &ObjectId, key: &EncryptionKey) -> LbxResult<ObjectMetadata> {
        Ok(self.session(id, key).await?.meta.clone())
    }

    /// The session for `id`, opened with `key` if none exists.
    ///
    /// An existing session only serves callers holding the key it was
    /// opened with; anyone else gets `AuthenticationFailure` before the
    /// cache or an in-flight decrypt is consulted.
    async fn session(&self, id: &ObjectId, key: &EncryptionKey) -> LbxResult<Arc<Session>> {
        let existing = self.sessions.lock().get(id).cloned();
        if let Some(session) = existing {
            return Self::authorize(session, key);
        }

        let meta = self.store.load_metadata(id, key).await?;
        let session = Arc::new(Session {
            meta,
            key: key.clone(),
            resident: Mutex::new(BTreeSet::new()),
            cancel: CancellationToken::new(),
            published_len: AtomicU64::new(0),
        });

        // Another caller may have opened it while metadata was loading
        let session = Arc::clone(self.sessions.lock().entry(*id).or_insert(session));
        debug!(%id, "streaming session open");
        Self::authorize(session, key)
    }

    fn authorize(session: Arc<Session>, key: &EncryptionKey) -> LbxResult<Arc<Session>> {
        if session.key == *key {
            Ok(session)
        } else {
            warn!(id = %session.meta.id, "streaming request with a different key rejected");
            Err(LbxError::auth(format!("session of {}", session.meta.id)))
        }
    }

    fn existing(&self, id: &ObjectId) -> LbxResult<Arc<Session>> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| LbxError::InvalidInput(format!("no open streaming session for {id}")))
    }

    /// End the session for `id`, cancelling its token. Returns whether one
    /// was open. Cached chunks stay for later sessions.
    pub fn close(&self, id: &ObjectId) -> bool {
        match self.sessions.lock().remove(id) {
            Some(session) => {
                session.cancel.cancel();
                info!(
                    %id,
                    resident = session.resident.lock().len(),
                    "streaming session closed"
                );
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, id: &ObjectId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Token fired when the session for `id` closes.
    pub fn session_token(&self, id: &ObjectId) -> Option<CancellationToken> {
        self.sessions.lock().get(id).map(|s| s.cancel.clone())
    }

    /// Chunk indices this session has served, ascending.
    pub fn resident_chunks(&self, id: &ObjectId) -> Vec<u32> {
        self.sessions
            .lock()
            .get(id)
            .map(|s| s.resident.lock().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record a new materialized length; lengths only grow.
    pub fn record_published(&self, id: &ObjectId, len: u64) {
        if let Some(session) = self.sessions.lock().get(id) {
            session.published_len.fetch_max(len, Ordering::AcqRel);
        }
    }

    pub fn published_len(&self, id: &ObjectId) -> Option<u64> {
        self.sessions
            .lock()
            .get(id)
            .map(|s| s.published_len.load(Ordering::Acquire))
    }

    /// Decrypted chunk `index` of `id`, opening a session if needed.
    ///
    /// Served from cache when present; otherwise joins the running decrypt
    /// for the same chunk or starts the only one.
    pub async fn get_chunk(&self, id: &ObjectId, index: u32, key: &EncryptionKey) -> LbxResult<Bytes> {
        let session = self.session(id, key).await?;
        self.fetch(&session, index, None).await
    }

    /// [`get_chunk`](Self::get_chunk) whose wait can be abandoned through
    /// `cancel`. The decrypt itself still completes for other waiters.
    pub async fn get_chunk_cancellable(
        &self,
        id: &ObjectId,
        index: u32,
        key: &EncryptionKey,
        cancel: &CancellationToken,
    ) -> LbxResult<Bytes> {
        let session = self.session(id, key).await?;
        self.fetch(&session, index, Some(cancel)).await
    }

    async fn fetch(
        &self,
        session: &Arc<Session>,
        index: u32,
        cancel: Option<&CancellationToken>,
    ) -> LbxResult<Bytes> {
        let id = session.meta.id;
        let count = session.chunk_count();
        if index >= count {
            return Err(LbxError::InvalidInput(format!(
                "chunk {index} out of range for {id} ({count} chunks)"
            )));
        }

        let store = self.store.clone();
        let key = session.key.clone();
        let data = match session.meta.layout {
            Layout::Single => {
                self.flights
                    .get_or_load(CacheKey::Object(id), cancel, move || async move {
                        store.load_payload(&id, &key).await
                    })
                    .await?
            }
            Layout::Chunked { .. } => {
                self.flights
                    .get_or_load(CacheKey::chunk(id, index), cancel, move || async move {
                        store.load_chunk(&id, index, &key).await
                    })
                    .await?
            }
        };
        session.resident.lock().insert(index);
        Ok(data)
    }

    /// Best-effort warm-up of chunks `from..from + count` of an open session.
    ///
    /// Runs one chunk at a time, yielding between chunks, and stops early
    /// when the session closes. Individual failures are logged and skipped.
    /// Returns the number of chunks now cached.
    pub async fn prefetch(&self, id: &ObjectId, from: u32, count: u32) -> LbxResult<u32> {
        let session = self.existing(id)?;
        let end = from.saturating_add(count).min(session.chunk_count());
        let mut warmed = 0;
        for index in from..end {
            if session.cancel.is_cancelled() {
                debug!(%id, chunk = index, "prefetch stopped, session closed");
                break;
            }
            match self.fetch(&session, index, Some(&session.cancel)).await {
                Ok(_) => warmed += 1,
                Err(LbxError::Cancelled) => break,
                Err(e) => warn!(%id, chunk = index, error = %e, "prefetch failed, continuing"),
            }
            tokio::task::yield_now().await;
        }
        debug!(%id, from, warmed, "prefetch done");
        Ok(warmed)
    }

    /// Plaintext bytes `start..end` (end exclusive) of `id`.
    pub async fn get_range(
        &self,
        id: &ObjectId,
        start: u64,
        end: u64,
        key: &EncryptionKey,
    ) -> LbxResult<Bytes> {
        let session = self.session(id, key).await?;
        let size = session.meta.size;
        if start > end || end > size {
            return Err(LbxError::InvalidInput(format!(
                "range {start}..{end} outside object {id} of {size} bytes"
            )));
        }
        if start == end {
            return Ok(Bytes::new());
        }

        match session.meta.layout {
            Layout::Single => {
                let whole = self.fetch(&session, 0, None).await?;
                if (whole.len() as u64) < end {
                    return Err(LbxError::SizeMismatch {
                        expected: size,
                        actual: whole.len() as u64,
                    });
                }
                Ok(whole.slice(start as usize..end as usize))
            }
            Layout::Chunked { chunk_size, .. } => {
                let indices = covering_chunks(start, end, chunk_size)?;
                let first = indices.start;
                let mut chunks = Vec::with_capacity(indices.len());
                for index in indices {
                    chunks.push(self.fetch(&session, index, None).await?);
                }
                let covered = match chunks.as_slice() {
                    [only] => only.clone(),
                    _ => {
                        let total = chunks.iter().map(Bytes::len).sum();
                        let mut joined = BytesMut::with_capacity(total);
                        for chunk in &chunks {
                            joined.extend_from_slice(chunk);
                        }
                        joined.freeze()
                    }
                };

                let offset = (start - u64::from(first) * chunk_size) as usize;
                let len = (end - start) as usize;
                if covered.len() < offset + len {
                    return Err(LbxError::Corrupted(format!(
                        "chunks of {id} shorter than declared size"
                    )));
                }
                Ok(covered.slice(offset..offset + len))
            }
        }
    }
}
