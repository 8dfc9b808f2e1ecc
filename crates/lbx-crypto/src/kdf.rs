//! Key derivation: PBKDF2-HMAC-SHA256 password → encryption key
//!
//! Output must stay bit-identical across platforms: a vault written on one
//! device is opened on another with nothing but the password and salt.

use lbx_core::{LbxError, LbxResult};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit symmetric key, held in memory for the session only.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a key from an untrusted slice, rejecting anything but 32 bytes.
    pub fn from_slice(slice: &[u8]) -> LbxResult<Self> {
        if slice.len() != KEY_SIZE {
            return Err(LbxError::InvalidKey {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

/// Constant-time comparison, so key checks leak nothing through timing.
impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for EncryptionKey {}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// HMAC-SHA256 iterations (default: 50000)
    pub iterations: u32,
    /// Output length in bytes; only 32 is accepted
    pub key_len: usize,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: lbx_core::config::DEFAULT_KDF_ITERATIONS,
            key_len: KEY_SIZE,
        }
    }
}

impl KdfParams {
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations,
            ..Self::default()
        }
    }
}

/// Derive a 256-bit key from a password and salt using PBKDF2-HMAC-SHA256.
///
/// Deliberately slow; call it from a blocking context, never from a task
/// that serves interactive work.
pub fn derive_key(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> LbxResult<EncryptionKey> {
    if password.expose_secret().is_empty() {
        return Err(LbxError::InvalidInput("password must not be empty".into()));
    }
    if salt.is_empty() {
        return Err(LbxError::InvalidInput("salt must not be empty".into()));
    }
    if params.iterations == 0 {
        return Err(LbxError::InvalidInput("iterations must be > 0".into()));
    }
    if params.key_len != KEY_SIZE {
        return Err(LbxError::InvalidKey {
            expected: KEY_SIZE,
            actual: params.key_len,
        });
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        params.iterations,
        &mut key,
    );
    let derived = EncryptionKey::from_bytes(key);
    key.zeroize();
    tracing::debug!(iterations = params.iterations, "key derived");
    Ok(derived)
}

/// Generate a random salt for a new vault. Salts are not secret.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}
