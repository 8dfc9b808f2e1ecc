use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LbxError, LbxResult};

/// Default PBKDF2 iteration count. Changing it makes existing vaults unreadable.
pub const DEFAULT_KDF_ITERATIONS: u32 = 50_000;

/// Reference chunk size for chunked objects (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Top-level configuration (loaded from lockbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LbxConfig {
    pub vault: VaultConfig,
    pub crypto: CryptoConfig,
    pub chunking: ChunkingConfig,
    pub cache: CacheConfig,
    pub streaming: StreamingConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Blob backend: "fs" or "memory"
    pub backend: String,
    /// Root directory for the "fs" backend
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iterations (default: 50000)
    pub kdf_iterations: u32,
    /// Base64-encoded KDF salt, written by `lbx init`
    pub salt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Plaintext bytes per chunk (default: 1 MiB)
    pub chunk_size: u64,
    /// Non-video objects at or above this size use the chunked layout
    pub chunk_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached entries (chunks + whole objects)
    pub max_entries: usize,
    /// Optional upper bound on cached plaintext bytes
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Chunks decrypted before a progressive stream reports PartiallyReady
    pub initial_chunk_budget: u32,
    /// Chunks decrypted concurrently per batch
    pub batch_size: u32,
    /// Newly decrypted chunks accumulated before the prefix is extended
    pub publish_every: u32,
    /// Chunks prefetched ahead of a foreground range read
    pub prefetch_ahead: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            backend: "fs".into(),
            root: PathBuf::from("~/.local/share/lockbox/vault"),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            salt: None,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_threshold: 10 * DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            max_bytes: Some(256 * 1024 * 1024),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            initial_chunk_budget: 2,
            batch_size: 2,
            publish_every: 2,
            prefetch_ahead: 4,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl LbxConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> LbxResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LbxError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> LbxResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LbxError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the store cannot operate with.
    pub fn validate(&self) -> LbxResult<()> {
        if self.chunking.chunk_size == 0 {
            return Err(LbxError::Config("chunking.chunk_size must be > 0".into()));
        }
        if self.crypto.kdf_iterations == 0 {
            return Err(LbxError::Config("crypto.kdf_iterations must be > 0".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(LbxError::Config("cache.max_entries must be > 0".into()));
        }
        if self.streaming.batch_size == 0 || self.streaming.publish_every == 0 {
            return Err(LbxError::Config(
                "streaming.batch_size and streaming.publish_every must be > 0".into(),
            ));
        }
        match self.vault.backend.as_str() {
            "fs" | "memory" => Ok(()),
            other => Err(LbxError::Config(format!(
                "unknown vault.backend {other:?} (expected \"fs\" or \"memory\")"
            ))),
        }
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}
