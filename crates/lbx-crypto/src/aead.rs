//! AES-256-GCM encryption of a single byte buffer
//!
//! Encrypted blob format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! A fresh nonce is drawn from the OS RNG on every call; the same key never
//! sees the same nonce twice in practice (2^-32 collision bound after 2^32
//! encryptions under one key).

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use lbx_core::{LbxError, LbxResult};

use crate::kdf::EncryptionKey;
use crate::{BLOB_OVERHEAD, NONCE_SIZE};

/// Encrypt `plaintext` with AES-256-GCM.
///
/// Returns: `[12-byte nonce][ciphertext][16-byte tag]`
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("AES-GCM encryption failed: {e}"))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Fails with `AuthenticationFailure` when the tag does not verify (wrong
/// key, flipped bits, truncation). No plaintext is returned on failure.
pub fn decrypt(blob: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>> {
    if blob.len() < BLOB_OVERHEAD {
        return Err(LbxError::auth(format!(
            "blob of {} bytes (minimum {BLOB_OVERHEAD})",
            blob.len()
        )));
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| LbxError::auth("blob"))
}

/// Length of the blob `encrypt` produces for `plaintext_len` bytes.
pub fn encrypted_len(plaintext_len: usize) -> usize {
    plaintext_len + BLOB_OVERHEAD
}
