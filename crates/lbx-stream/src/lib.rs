//! lbx-stream: decrypted-chunk cache, single-flight chunk loads, streaming
//! sessions and progressive loading
//!
//! Foreground reads, background prefetch and progressive loaders for
//! different objects share one [`ChunkCache`] and one in-flight map; no two
//! callers decrypt the same `(object, chunk)` concurrently.

pub mod cache;
pub mod progressive;
pub mod session;
pub mod singleflight;
pub mod vault;

pub use cache::{CacheKey, CacheStats, ChunkCache};
pub use progressive::{
    ArtifactSink, LoaderState, MaterializedArtifact, ProgressiveLoader, ProgressiveOptions,
    ProgressiveStream,
};
pub use session::StreamingSessionManager;
pub use singleflight::SingleFlight;
pub use vault::Vault;
