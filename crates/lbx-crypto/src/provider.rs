//! Crypto capability injected into the store.
//!
//! The store and streaming layers make every KDF and AEAD call through a
//! `CryptoProvider`; platform implementations live at the application edge.

use lbx_core::LbxResult;
use secrecy::SecretString;

use crate::kdf::{EncryptionKey, KdfParams};

pub trait CryptoProvider: Send + Sync {
    /// PBKDF2-HMAC-SHA256; must match [`crate::kdf::derive_key`] bit for bit.
    fn derive_key(
        &self,
        password: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> LbxResult<EncryptionKey>;

    /// AES-256-GCM with a fresh random nonce: `nonce || ciphertext || tag`.
    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>>;

    /// Inverse of `encrypt`; `AuthenticationFailure` on tag mismatch.
    fn decrypt(&self, blob: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>>;
}

/// Pure-Rust implementation (`pbkdf2` + `aes-gcm`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCrypto;

impl CryptoProvider for SoftwareCrypto {
    fn derive_key(
        &self,
        password: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> LbxResult<EncryptionKey> {
        crate::kdf::derive_key(password, salt, params)
    }

    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>> {
        crate::aead::encrypt(plaintext, key)
    }

    fn decrypt(&self, blob: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>> {
        crate::aead::decrypt(blob, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn software_provider_is_object_safe_and_interoperable() {
        let provider: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let key = provider
            .derive_key(
                &SecretString::from("hunter2"),
                b"0123456789abcdef",
                &KdfParams::with_iterations(10),
            )
            .unwrap();

        let blob = provider.encrypt(b"payload", &key).unwrap();
        // Blobs from the provider open with the free functions and vice versa
        assert_eq!(crate::aead::decrypt(&blob, &key).unwrap(), b"payload");
        let blob = crate::aead::encrypt(b"other", &key).unwrap();
        assert_eq!(provider.decrypt(&blob, &key).unwrap(), b"other");
    }
}
