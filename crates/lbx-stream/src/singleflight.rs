//! Single-flight decrypts: at most one running load per cache key.
//!
//! The load runs on its own task, so it completes (and lands in the cache)
//! even when every caller that was waiting on it gives up. Each waiter can
//! abandon the wait with its own token without affecting the others.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lbx_core::{LbxError, LbxResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheKey, ChunkCache};

type Flight = Shared<BoxFuture<'static, LbxResult<Bytes>>>;

pub struct SingleFlight {
    cache: Arc<ChunkCache>,
    inflight: Arc<Mutex<HashMap<CacheKey, Flight>>>,
    started: AtomicU64,
}

impl std::fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("inflight", &self.inflight.lock().len())
            .field("started", &self.started())
            .finish()
    }
}

impl SingleFlight {
    pub fn new(cache: Arc<ChunkCache>) -> Self {
        Self {
            cache,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            started: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Loads started since construction.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Cached bytes for `key`, else the result of the one load for `key`.
    ///
    /// `load` is invoked only when neither a cached entry nor a running
    /// load exists. A successful result is cached before the flight is
    /// retired, so a later caller sees either the flight or the entry.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: CacheKey,
        cancel: Option<&CancellationToken>,
        load: F,
    ) -> LbxResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LbxResult<Bytes>> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.inflight.lock();
            if let Some(hit) = self.cache.get(&key) {
                return Ok(hit);
            }
            match inflight.get(&key) {
                Some(flight) => {
                    debug!(?key, "joining in-flight load");
                    flight.clone()
                }
                None => {
                    let flight = self.launch(key, load());
                    inflight.insert(key, flight.clone());
                    flight
                }
            }
        };

        match cancel {
            Some(token) => tokio::select! {
                result = flight => result,
                _ = token.cancelled() => Err(LbxError::Cancelled),
            },
            None => flight.await,
        }
    }

    fn launch<Fut>(&self, key: CacheKey, work: Fut) -> Flight
    where
        Fut: Future<Output = LbxResult<Bytes>> + Send + 'static,
    {
        self.started.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::clone(&self.cache);
        let inflight = Arc::clone(&self.inflight);
        let generation = cache.generation(&key.object());
        let handle = tokio::spawn(async move {
            let result = work.await;
            if let Ok(data) = &result {
                cache.put_if_current(key, data.clone(), generation);
            }
            inflight.lock().remove(&key);
            result
        });
        async move {
            handle
                .await
                .map_err(|e| LbxError::from(anyhow::anyhow!("load task failed: {e}")))?
        }
        .boxed()
        .shared()
    }
}
