//! lbx-crypto: encryption primitives for the lockbox object store
//!
//! Blob format (AES-256-GCM):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! Key flow:
//! ```text
//! password + salt ──PBKDF2-HMAC-SHA256 (50k iters)──▶ EncryptionKey (256-bit, memory only)
//!   ├── metadata JSON   → one blob
//!   ├── small payloads  → one blob
//!   └── large / video   → one blob per fixed-size chunk (independent nonce + tag)
//! ```
//!
//! Per-chunk AEAD trades one global integrity check for many local ones so a
//! prefix can be decrypted and served before the rest of the object is read.

pub mod aead;
pub mod chunk;
pub mod kdf;
pub mod provider;

pub use aead::{decrypt, encrypt};
pub use chunk::{decrypt_chunk, encrypt_chunked, plan_chunks, reassemble, ChunkDescriptor};
pub use kdf::{derive_key, generate_salt, EncryptionKey, KdfParams};
pub use provider::{CryptoProvider, SoftwareCrypto};

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes an encrypted blob adds on top of its plaintext
pub const BLOB_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Size of a freshly generated KDF salt
pub const SALT_SIZE: usize = 16;
