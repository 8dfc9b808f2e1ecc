//! Streaming, progressive loading and single-flight behaviour end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lbx_core::config::LbxConfig;
use lbx_core::{LbxError, LbxResult};
use lbx_crypto::{CryptoProvider, EncryptionKey, KdfParams, SoftwareCrypto};
use lbx_storage::{BlobStorage, OpendalBlobStorage};
use lbx_store::{names, ListFilter, ObjectStore, SaveRequest, StoreOptions};
use lbx_stream::{
    ArtifactSink, CacheKey, ChunkCache, LoaderState, ProgressiveLoader, ProgressiveOptions,
    StreamingSessionManager, Vault,
};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

const MIB: usize = 1024 * 1024;

/// Software crypto that counts decrypt calls.
#[derive(Default)]
struct CountingCrypto {
    decrypts: AtomicUsize,
}

impl CryptoProvider for CountingCrypto {
    fn derive_key(
        &self,
        password: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> LbxResult<EncryptionKey> {
        SoftwareCrypto.derive_key(password, salt, params)
    }

    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>> {
        SoftwareCrypto.encrypt(plaintext, key)
    }

    fn decrypt(&self, blob: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>> {
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        SoftwareCrypto.decrypt(blob, key)
    }
}

struct Fixture {
    storage: Arc<OpendalBlobStorage>,
    crypto: Arc<CountingCrypto>,
    manager: Arc<StreamingSessionManager>,
}

fn fixture(chunk_size: u64) -> Fixture {
    let storage = Arc::new(OpendalBlobStorage::memory().unwrap());
    let crypto = Arc::new(CountingCrypto::default());
    let store = ObjectStore::with_crypto(
        storage.clone(),
        crypto.clone(),
        StoreOptions {
            chunk_size,
            chunk_threshold: chunk_size * 4,
        },
    );
    let manager = Arc::new(StreamingSessionManager::new(
        store,
        Arc::new(ChunkCache::new(256, None)),
    ));
    Fixture {
        storage,
        crypto,
        manager,
    }
}

fn key() -> EncryptionKey {
    EncryptionKey::from_bytes([0x5a; 32])
}

fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<u8>>())
}

async fn save_video(fx: &Fixture, data: Bytes) -> lbx_core::ObjectMetadata {
    fx.manager
        .store()
        .save(data, SaveRequest::new("clip.mp4", "video/mp4"), &key())
        .await
        .unwrap()
}

fn opts(initial: u32, batch: u32, publish_every: u32) -> ProgressiveOptions {
    ProgressiveOptions {
        initial_chunk_budget: initial,
        batch_size: batch,
        publish_every,
        sink: ArtifactSink::Memory,
    }
}

#[tokio::test]
async fn concurrent_get_chunk_decrypts_once() {
    let fx = fixture(1024);
    let meta = save_video(&fx, pattern(4096)).await;
    fx.manager.open(&meta.id, &key()).await.unwrap();

    let before = fx.crypto.decrypts.load(Ordering::SeqCst);
    let key = key();
    let (a, b) = tokio::join!(
        fx.manager.get_chunk(&meta.id, 0, &key),
        fx.manager.get_chunk(&meta.id, 0, &key),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(fx.crypto.decrypts.load(Ordering::SeqCst) - before, 1);

    // Cached now: no further decrypts
    fx.manager.get_chunk(&meta.id, 0, &key).await.unwrap();
    assert_eq!(fx.crypto.decrypts.load(Ordering::SeqCst) - before, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_tasks_decrypt_each_chunk_once() {
    let fx = fixture(1024);
    let meta = save_video(&fx, pattern(8 * 1024)).await;
    fx.manager.open(&meta.id, &key()).await.unwrap();
    let before = fx.crypto.decrypts.load(Ordering::SeqCst);

    let mut tasks = Vec::new();
    for round in 0..16u32 {
        let manager = Arc::clone(&fx.manager);
        let id = meta.id;
        tasks.push(tokio::spawn(async move {
            let key = key();
            if round % 2 == 0 {
                manager.get_chunk(&id, round % 8, &key).await.map(|_| ())
            } else {
                manager.prefetch(&id, 0, 8).await.map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(fx.crypto.decrypts.load(Ordering::SeqCst) - before, 8);
    assert_eq!(fx.manager.decrypts_started(), 8);
}

#[tokio::test]
async fn cancelled_waiter_leaves_the_decrypt_for_others() {
    let fx = fixture(1024);
    let meta = save_video(&fx, pattern(2048)).await;
    let key = key();
    let token = CancellationToken::new();
    token.cancel();

    let (cancelled, served) = tokio::join!(
        fx.manager.get_chunk_cancellable(&meta.id, 1, &key, &token),
        fx.manager.get_chunk(&meta.id, 1, &key),
    );
    assert!(cancelled.unwrap_err().is_cancelled());
    assert_eq!(served.unwrap(), pattern(2048).slice(1024..));
}

#[tokio::test]
async fn progressive_stream_publishes_initial_prefix_then_completes() {
    let fx = fixture(MIB as u64);
    let data = pattern(5 * MIB);
    let meta = save_video(&fx, data.clone()).await;
    assert_eq!(meta.layout.blob_count(), 5);

    let stream = ProgressiveLoader::start(
        Arc::clone(&fx.manager),
        meta.id,
        &key(),
        opts(2, 2, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // The background task has not run yet on this single-threaded runtime
    assert_eq!(stream.initial_len(), 2 * MIB as u64);
    assert_eq!(stream.state(), LoaderState::PartiallyReady);
    assert_eq!(
        stream.artifact().read(0..stream.initial_len()).await.unwrap(),
        data.slice(..2 * MIB)
    );

    assert_eq!(stream.wait().await.unwrap(), 5 * MIB as u64);
    assert_eq!(stream.state(), LoaderState::Complete);
    assert_eq!(stream.artifact().snapshot().await.unwrap(), data);
    assert_eq!(fx.manager.published_len(&meta.id), Some(5 * MIB as u64));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn materialized_prefix_grows_monotonically() {
    let fx = fixture(1024);
    let data = pattern(40 * 1024 + 17);
    let meta = save_video(&fx, data.clone()).await;

    let stream = ProgressiveLoader::start(
        Arc::clone(&fx.manager),
        meta.id,
        &key(),
        opts(1, 2, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let artifact = Arc::clone(stream.artifact());
    let mut lengths = artifact.subscribe();
    let mut previous = 0u64;
    loop {
        let len = *lengths.borrow_and_update();
        assert!(len >= previous, "prefix shrank from {previous} to {len}");
        let prefix = artifact.read(0..len).await.unwrap();
        assert_eq!(prefix, data.slice(..len as usize));
        previous = len;
        if len == data.len() as u64 {
            break;
        }
        lengths.changed().await.unwrap();
    }
    assert_eq!(stream.wait().await.unwrap(), data.len() as u64);
}

#[tokio::test]
async fn cancel_stops_background_at_batch_boundary() {
    let fx = fixture(1024);
    let meta = save_video(&fx, pattern(16 * 1024)).await;

    let stream = ProgressiveLoader::start(
        Arc::clone(&fx.manager),
        meta.id,
        &key(),
        opts(2, 1, 1),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    stream.cancel();

    let err = stream.wait().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(stream.state(), LoaderState::Cancelled);
    // The published prefix is still readable
    assert_eq!(stream.artifact().len(), 2048);
    assert_eq!(
        stream.artifact().snapshot().await.unwrap(),
        pattern(16 * 1024).slice(..2048)
    );
}

#[tokio::test]
async fn cancelled_file_artifact_is_deleted() {
    let fx = fixture(1024);
    let meta = save_video(&fx, pattern(16 * 1024)).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.part");

    let stream = ProgressiveLoader::start(
        Arc::clone(&fx.manager),
        meta.id,
        &key(),
        opts(1, 1, 1).with_sink(ArtifactSink::File(path.clone())),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(stream.artifact().path(), Some(path.as_path()));
    assert_eq!(std::fs::read(&path).unwrap().len(), 1024);

    // Closing the session cancels its loaders too
    assert!(fx.manager.close(&meta.id));
    assert!(stream.wait().await.unwrap_err().is_cancelled());
    assert!(!path.exists());
}

#[tokio::test]
async fn chunk_failure_fails_background_once_and_keeps_prefix() {
    let fx = fixture(1024);
    let data = pattern(8 * 1024);
    let meta = save_video(&fx, data.clone()).await;

    let name = names::chunk_name(&meta.id, 3);
    let mut blob = fx.storage.read_blob(&name).await.unwrap().to_vec();
    let last = blob.len() - 1;
    blob[last] ^= 0xff;
    fx.storage.write_blob(&name, Bytes::from(blob)).await.unwrap();

    let stream = ProgressiveLoader::start(
        Arc::clone(&fx.manager),
        meta.id,
        &key(),
        opts(2, 2, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let err = stream.wait().await.unwrap_err();
    assert!(err.is_auth_failure(), "got {err:?}");
    assert!(err.to_string().contains("chunk 3"));
    // A second wait sees the same single outcome
    assert!(stream.wait().await.unwrap_err().is_auth_failure());
    assert_eq!(stream.state(), LoaderState::Failed);
    assert_eq!(stream.artifact().len(), 2048);
    assert_eq!(stream.artifact().snapshot().await.unwrap(), data.slice(..2048));
}

#[tokio::test]
async fn failure_in_initial_budget_is_returned_from_start() {
    let fx = fixture(1024);
    let meta = save_video(&fx, pattern(4096)).await;
    fx.storage
        .delete_blob(&names::chunk_name(&meta.id, 0))
        .await
        .unwrap();

    let err = ProgressiveLoader::start(
        Arc::clone(&fx.manager),
        meta.id,
        &key(),
        opts(2, 2, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");
}

#[tokio::test]
async fn single_layout_stream_completes_immediately() {
    let fx = fixture(1024);
    let data = pattern(100);
    let meta = fx
        .manager
        .store()
        .save(data.clone(), SaveRequest::new("a.txt", "text/plain"), &key())
        .await
        .unwrap();

    let stream = ProgressiveLoader::start(
        Arc::clone(&fx.manager),
        meta.id,
        &key(),
        opts(2, 2, 2),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(stream.state(), LoaderState::Complete);
    assert_eq!(stream.wait().await.unwrap(), 100);
    assert_eq!(stream.artifact().snapshot().await.unwrap(), data);
}

fn memory_config() -> LbxConfig {
    let mut cfg = LbxConfig::default();
    cfg.vault.backend = "memory".into();
    cfg.crypto.kdf_iterations = 1000;
    cfg.chunking.chunk_size = 1024;
    cfg.chunking.chunk_threshold = 8 * 1024;
    cfg.streaming.prefetch_ahead = 2;
    cfg
}

#[tokio::test]
async fn vault_end_to_end() {
    let vault = Vault::open(&memory_config()).unwrap();
    let salt = lbx_crypto::generate_salt();
    let key = vault
        .derive_key(&SecretString::from("hunter2"), &salt)
        .await
        .unwrap();
    let wrong = vault
        .derive_key(&SecretString::from("hunter3"), &salt)
        .await
        .unwrap();

    let data = pattern(10 * 1024);
    let meta = vault
        .save_object(data.clone(), SaveRequest::new("movie.mp4", "video/mp4").folder(["media"]), &key)
        .await
        .unwrap();

    let (loaded, _) = vault.load_object(&meta.id, &key, None).await.unwrap();
    assert_eq!(loaded, data);
    let hits = vault.cache_stats().hits;
    vault.load_object(&meta.id, &key, None).await.unwrap();
    assert_eq!(vault.cache_stats().hits, hits + 1);

    assert!(vault
        .load_object(&meta.id, &wrong, None)
        .await
        .unwrap_err()
        .is_auth_failure());

    let range = vault.get_chunk_range(&meta.id, 1000, 1100, &key).await.unwrap();
    assert_eq!(range, data.slice(1000..1100));

    // Chunks 2 and 3 are prefetched behind the read
    let mut waited = Duration::ZERO;
    while !vault.cache().contains(&CacheKey::chunk(meta.id, 3)) {
        assert!(waited < Duration::from_secs(5), "prefetch never landed");
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }

    let listed = vault.list_objects(&key, &ListFilter::default()).await.unwrap();
    assert_eq!(listed.len(), 1);

    let report = vault.delete_object(&meta.id).await.unwrap();
    assert!(report.is_complete());
    assert!(!vault.sessions().is_open(&meta.id));
    assert!(!vault.cache().contains(&CacheKey::Object(meta.id)));
    assert!(!vault.cache().contains(&CacheKey::chunk(meta.id, 3)));
    assert!(matches!(
        vault.load_object(&meta.id, &key, None).await,
        Err(LbxError::NotFound(_))
    ));
    assert_eq!(vault.health().await.unwrap(), 0);
}

#[tokio::test]
async fn open_session_does_not_serve_a_wrong_key() {
    let vault = Vault::open(&memory_config()).unwrap();
    let salt = lbx_crypto::generate_salt();
    let key = vault
        .derive_key(&SecretString::from("hunter2"), &salt)
        .await
        .unwrap();
    let wrong = vault
        .derive_key(&SecretString::from("hunter3"), &salt)
        .await
        .unwrap();

    let data = Bytes::from(vec![42u8; 10 * 1024]);
    let meta = vault
        .save_object(data.clone(), SaveRequest::new("movie.mp4", "video/mp4"), &key)
        .await
        .unwrap();

    // Without a session the metadata check rejects the key
    let err = vault.get_chunk_range(&meta.id, 0, 10, &wrong).await.unwrap_err();
    assert!(err.is_auth_failure(), "got {err:?}");

    // With the rightful session open and chunks cached, still rejected
    assert_eq!(
        vault.get_chunk_range(&meta.id, 0, 10, &key).await.unwrap(),
        data.slice(0..10)
    );
    assert!(vault.sessions().is_open(&meta.id));
    for (start, end) in [(0, 10), (2000, 2010)] {
        let err = vault
            .get_chunk_range(&meta.id, start, end, &wrong)
            .await
            .unwrap_err();
        assert!(err.is_auth_failure(), "{start}..{end}: got {err:?}");
    }
    let err = vault
        .sessions()
        .get_chunk(&meta.id, 0, &wrong)
        .await
        .unwrap_err();
    assert!(err.is_auth_failure());
    let err = vault
        .open_progressive_stream(&meta.id, &wrong, vault.progressive_options())
        .await
        .unwrap_err();
    assert!(err.is_auth_failure());

    // The rightful holder is unaffected
    assert_eq!(
        vault.get_chunk_range(&meta.id, 2000, 2010, &key).await.unwrap(),
        data.slice(2000..2010)
    );
}

#[tokio::test]
async fn vault_progressive_stream_uses_config_defaults() {
    let vault = Vault::open(&memory_config()).unwrap();
    let key = EncryptionKey::from_bytes([9; 32]);
    let data = pattern(6 * 1024);
    let meta = vault
        .save_object(data.clone(), SaveRequest::new("v.webm", "video/webm"), &key)
        .await
        .unwrap();

    let stream = vault
        .open_progressive_stream(&meta.id, &key, vault.progressive_options())
        .await
        .unwrap();
    assert!(stream.initial_len() <= 2 * 1024);
    assert_eq!(stream.wait().await.unwrap(), data.len() as u64);
    assert_eq!(stream.artifact().snapshot().await.unwrap(), data);
    assert!(vault.close_stream(&meta.id));
}
