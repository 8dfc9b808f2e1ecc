//! Progressive loading of chunked objects.
//!
//! ```text
//! Idle -> LoadingInitial -> PartiallyReady -> BackgroundLoading -> Complete
//!                                                              \-> Cancelled
//!                                                              \-> Failed
//! ```
//!
//! `start` decrypts an initial chunk budget and returns once a playable
//! prefix exists. A background task decrypts the rest in the same batch
//! size and appends to the [`MaterializedArtifact`] in ascending chunk
//! order. Published bytes are never rewritten, so its length is monotonic.
//! Cancellation is observed between batches only.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use lbx_core::config::StreamingConfig;
use lbx_core::{LbxError, LbxResult, Layout, ObjectId, ObjectMetadata};
use lbx_crypto::EncryptionKey;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::StreamingSessionManager;

/// Upper bound on the memory reserved up front for an in-memory artifact;
/// past this the buffer grows with appended chunks.
const INITIAL_RESERVE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Idle,
    LoadingInitial,
    PartiallyReady,
    BackgroundLoading,
    Complete,
    Cancelled,
    Failed,
}

impl LoaderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoaderState::Complete | LoaderState::Cancelled | LoaderState::Failed
        )
    }
}

/// Where the materialized prefix is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ArtifactSink {
    #[default]
    Memory,
    /// Appended to a file at this path (created or truncated)
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ProgressiveOptions {
    pub initial_chunk_budget: u32,
    pub batch_size: u32,
    /// Newly decrypted chunks held back before the prefix is extended
    pub publish_every: u32,
    pub sink: ArtifactSink,
}

impl Default for ProgressiveOptions {
    fn default() -> Self {
        Self::from(&StreamingConfig::default())
    }
}

impl From<&StreamingConfig> for ProgressiveOptions {
    fn from(cfg: &StreamingConfig) -> Self {
        Self {
            initial_chunk_budget: cfg.initial_chunk_budget,
            batch_size: cfg.batch_size,
            publish_every: cfg.publish_every,
            sink: ArtifactSink::Memory,
        }
    }
}

impl ProgressiveOptions {
    pub fn with_sink(mut self, sink: ArtifactSink) -> Self {
        self.sink = sink;
        self
    }
}

enum Backing {
    Memory(RwLock<Vec<u8>>),
    File {
        path: PathBuf,
        writer: tokio::sync::Mutex<tokio::fs::File>,
    },
}

/// Append-only decrypted prefix of an object.
pub struct MaterializedArtifact {
    backing: Backing,
    total_len: u64,
    len_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for MaterializedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedArtifact")
            .field("len", &self.len())
            .field("total_len", &self.total_len)
            .field("path", &self.path())
            .finish()
    }
}

impl MaterializedArtifact {
    async fn create(sink: &ArtifactSink, total_len: u64) -> LbxResult<Self> {
        let backing = match sink {
            ArtifactSink::Memory => {
                let reserve = total_len.min(INITIAL_RESERVE) as usize;
                Backing::Memory(RwLock::new(Vec::with_capacity(reserve)))
            }
            ArtifactSink::File(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = tokio::fs::File::create(path).await?;
                Backing::File {
                    path: path.clone(),
                    writer: tokio::sync::Mutex::new(file),
                }
            }
        };
        let (len_tx, _) = watch::channel(0);
        Ok(Self {
            backing,
            total_len,
            len_tx,
        })
    }

    /// Bytes published so far.
    pub fn len(&self) -> u64 {
        *self.len_tx.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the object once fully materialized.
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn is_complete(&self) -> bool {
        self.len() == self.total_len
    }

    /// Backing file of a file sink.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { path, .. } => Some(path),
        }
    }

    /// Receiver notified on every published length.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.len_tx.subscribe()
    }

    /// Copy of published bytes `range`. Ranges past the published length
    /// are rejected.
    pub async fn read(&self, range: Range<u64>) -> LbxResult<Bytes> {
        let len = self.len();
        if range.start > range.end || range.end > len {
            return Err(LbxError::InvalidInput(format!(
                "range {}..{} beyond materialized length {len}",
                range.start, range.end
            )));
        }
        let want = (range.end - range.start) as usize;
        match &self.backing {
            Backing::Memory(buf) => {
                let buf = buf.read();
                Ok(Bytes::copy_from_slice(
                    &buf[range.start as usize..range.end as usize],
                ))
            }
            Backing::File { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut out = BytesMut::zeroed(want);
                file.read_exact(&mut out).await?;
                Ok(out.freeze())
            }
        }
    }

    /// Whole published prefix.
    pub async fn snapshot(&self) -> LbxResult<Bytes> {
        self.read(0..self.len()).await
    }

    /// Append `data` and publish the new length.
    async fn append(&self, data: &[u8]) -> LbxResult<u64> {
        match &self.backing {
            Backing::Memory(buf) => {
                buf.write().extend_from_slice(data);
            }
            Backing::File { writer, .. } => {
                let mut file = writer.lock().await;
                file.write_all(data).await?;
                file.flush().await?;
            }
        }
        let new_len = self.len() + data.len() as u64;
        self.len_tx.send_replace(new_len);
        Ok(new_len)
    }

    /// Release a cancelled artifact: a file sink is deleted. A memory
    /// prefix stays readable by existing holders.
    async fn discard(&self) {
        if let Backing::File { path, .. } = &self.backing {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "removing cancelled artifact");
            }
        }
    }
}

type Completion = Shared<BoxFuture<'static, LbxResult<u64>>>;

/// Handle to a running progressive load.
pub struct ProgressiveStream {
    meta: ObjectMetadata,
    artifact: Arc<MaterializedArtifact>,
    initial_len: u64,
    state: watch::Receiver<LoaderState>,
    completion: Completion,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ProgressiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveStream")
            .field("id", &self.meta.id)
            .field("state", &self.state())
            .field("initial_len", &self.initial_len)
            .field("artifact", &self.artifact)
            .finish()
    }
}

impl ProgressiveStream {
    pub fn metadata(&self) -> &ObjectMetadata {
        &self.meta
    }

    /// The growing prefix.
    pub fn artifact(&self) -> &Arc<MaterializedArtifact> {
        &self.artifact
    }

    /// Prefix length when `start` returned.
    pub fn initial_len(&self) -> u64 {
        self.initial_len
    }

    pub fn state(&self) -> LoaderState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoaderState> {
        self.state.clone()
    }

    /// Resolves once the load ends: the final length on completion,
    /// `Cancelled`, or the first chunk failure.
    pub async fn wait(&self) -> LbxResult<u64> {
        self.completion.clone().await
    }

    /// Request cancellation; takes effect at the next batch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct ProgressiveLoader;

impl ProgressiveLoader {
    /// Begin loading `id`, returning once the initial budget is decrypted.
    ///
    /// Loading also stops when `cancel` fires or the object's streaming
    /// session is closed. Errors during the initial phase are returned
    /// directly; later ones surface through [`ProgressiveStream::wait`].
    pub async fn start(
        manager: Arc<StreamingSessionManager>,
        id: ObjectId,
        key: &EncryptionKey,
        opts: ProgressiveOptions,
        cancel: CancellationToken,
    ) -> LbxResult<ProgressiveStream> {
        let (state_tx, state_rx) = watch::channel(LoaderState::Idle);
        state_tx.send_replace(LoaderState::LoadingInitial);

        let meta = manager.open(&id, key).await?;
        let session_cancel = manager.session_token(&id).unwrap_or_default();
        let artifact = Arc::new(MaterializedArtifact::create(&opts.sink, meta.size).await?);
        let job = Job {
            manager,
            id,
            key: key.clone(),
            artifact: Arc::clone(&artifact),
            batch_size: opts.batch_size.max(1),
            publish_every: opts.publish_every.max(1),
            cancel: cancel.clone(),
            session_cancel,
            state: state_tx,
        };

        let chunk_count = match meta.layout {
            Layout::Single => 1,
            Layout::Chunked { chunk_count, .. } => chunk_count,
        };
        let initial = opts.initial_chunk_budget.min(chunk_count);

        if let Err(e) = job.run_initial(initial).await {
            let terminal = if e.is_cancelled() {
                LoaderState::Cancelled
            } else {
                LoaderState::Failed
            };
            job.artifact.discard().await;
            job.state.send_replace(terminal);
            return Err(e);
        }

        let initial_len = artifact.len();
        job.state.send_replace(LoaderState::PartiallyReady);
        info!(%id, initial_len, total = meta.size, "progressive stream ready");

        let completion = if initial == chunk_count {
            let len = job.finish();
            futures::future::ready(Ok(len)).boxed().shared()
        } else {
            let handle = tokio::spawn(job.run_background(initial, chunk_count));
            async move {
                handle
                    .await
                    .map_err(|e| LbxError::from(anyhow::anyhow!("background load failed: {e}")))?
            }
            .boxed()
            .shared()
        };

        Ok(ProgressiveStream {
            meta,
            artifact,
            initial_len,
            state: state_rx,
            completion,
            cancel,
        })
    }
}

struct Job {
    manager: Arc<StreamingSessionManager>,
    id: ObjectId,
    key: EncryptionKey,
    artifact: Arc<MaterializedArtifact>,
    batch_size: u32,
    publish_every: u32,
    cancel: CancellationToken,
    session_cancel: CancellationToken,
    state: watch::Sender<LoaderState>,
}

impl Job {
    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.session_cancel.is_cancelled()
    }

    async fn decrypt_batch(&self, indices: Range<u32>) -> LbxResult<Vec<Bytes>> {
        let manager = &self.manager;
        let (id, key) = (&self.id, &self.key);
        try_join_all(indices.map(|index| manager.get_chunk(id, index, key))).await
    }

    /// Extend the artifact by all pending chunks in one append.
    async fn publish(&self, pending: &mut Vec<Bytes>) -> LbxResult<()> {
        let total = pending.iter().map(Bytes::len).sum();
        let mut joined = BytesMut::with_capacity(total);
        for chunk in pending.drain(..) {
            joined.extend_from_slice(&chunk);
        }
        let len = self.artifact.append(&joined).await?;
        self.manager.record_published(&self.id, len);
        Ok(())
    }

    async fn run_initial(&self, initial: u32) -> LbxResult<()> {
        let mut next = 0;
        while next < initial {
            if self.cancelled() {
                return Err(LbxError::Cancelled);
            }
            let end = (next + self.batch_size).min(initial);
            let mut batch = self.decrypt_batch(next..end).await?;
            self.publish(&mut batch).await?;
            debug!(id = %self.id, chunks = end, "initial batch decrypted");
            next = end;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn finish(&self) -> u64 {
        let len = self.artifact.len();
        self.state.send_replace(LoaderState::Complete);
        info!(id = %self.id, bytes = len, "progressive stream complete");
        len
    }

    async fn run_background(self, from: u32, chunk_count: u32) -> LbxResult<u64> {
        self.state.send_replace(LoaderState::BackgroundLoading);
        let mut pending: Vec<Bytes> = Vec::new();
        let mut next = from;
        while next < chunk_count {
            if self.cancelled() {
                debug!(id = %self.id, published = self.artifact.len(), "progressive stream cancelled");
                self.artifact.discard().await;
                self.state.send_replace(LoaderState::Cancelled);
                return Err(LbxError::Cancelled);
            }
            let end = (next + self.batch_size).min(chunk_count);
            match self.decrypt_batch(next..end).await {
                Ok(batch) => pending.extend(batch),
                Err(e) => {
                    warn!(
                        id = %self.id,
                        published = self.artifact.len(),
                        error = %e,
                        "background decrypt failed, keeping published prefix"
                    );
                    self.state.send_replace(LoaderState::Failed);
                    return Err(e);
                }
            }
            next = end;
            if pending.len() as u32 >= self.publish_every || next == chunk_count {
                if let Err(e) = self.publish(&mut pending).await {
                    self.state.send_replace(LoaderState::Failed);
                    return Err(e);
                }
            }
            tokio::task::yield_now().await;
        }
        Ok(self.finish())
    }
}
