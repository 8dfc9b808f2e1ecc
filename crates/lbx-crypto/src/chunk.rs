//! Chunked object codec
//!
//! A large object is split into fixed-size plaintext chunks (the last one may
//! be shorter). Each chunk is a complete, independent AES-GCM blob with its
//! own nonce and tag:
//! ```text
//! chunk i = [12-byte nonce][ciphertext of bytes i*S .. min((i+1)*S, N)][16-byte tag]
//! ```
//!
//! Whole-object AEAD cannot verify anything until the last byte arrives, so
//! streamable objects use this layout to decrypt and serve a prefix early.

use std::ops::Range;

use lbx_core::{LbxError, LbxResult};
use rayon::prelude::*;

use crate::kdf::EncryptionKey;
use crate::provider::{CryptoProvider, SoftwareCrypto};

/// Position of one chunk within the plaintext of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    /// First plaintext byte (inclusive)
    pub start: u64,
    /// Last plaintext byte (exclusive)
    pub end: u64,
}

impl ChunkDescriptor {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn byte_range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// Number of chunks needed for `total_size` bytes.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> LbxResult<u32> {
    if chunk_size == 0 {
        return Err(LbxError::InvalidInput("chunk size must be > 0".into()));
    }
    let count = total_size.div_ceil(chunk_size);
    u32::try_from(count).map_err(|_| {
        LbxError::InvalidInput(format!(
            "{total_size} bytes in {chunk_size}-byte chunks exceeds the chunk index range"
        ))
    })
}

/// Deterministic fixed-size chunk plan for an object of `total_size` bytes.
///
/// An empty object has no chunks.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> LbxResult<Vec<ChunkDescriptor>> {
    let count = chunk_count(total_size, chunk_size)?;
    Ok((0..count)
        .map(|index| {
            let start = index as u64 * chunk_size;
            ChunkDescriptor {
                index,
                start,
                end: (start + chunk_size).min(total_size),
            }
        })
        .collect())
}

/// Indices of the chunks covering plaintext bytes `start..end`.
pub fn covering_chunks(start: u64, end: u64, chunk_size: u64) -> LbxResult<Range<u32>> {
    if chunk_size == 0 {
        return Err(LbxError::InvalidInput("chunk size must be > 0".into()));
    }
    if start >= end {
        return Ok(0..0);
    }
    let first = start / chunk_size;
    let last = (end - 1) / chunk_size;
    let to_u32 = |v: u64| {
        u32::try_from(v).map_err(|_| LbxError::InvalidInput(format!("chunk index {v} out of range")))
    };
    Ok(to_u32(first)?..to_u32(last)? + 1)
}

/// Encrypt `plaintext` as independent chunks, one AEAD call per chunk.
pub fn encrypt_chunked(
    plaintext: &[u8],
    key: &EncryptionKey,
    chunk_size: u64,
) -> LbxResult<Vec<Vec<u8>>> {
    encrypt_chunked_with(&SoftwareCrypto, plaintext, key, chunk_size)
}

/// [`encrypt_chunked`] through an injected provider. Chunks are encrypted in
/// parallel on the rayon pool; output order follows chunk index.
pub fn encrypt_chunked_with(
    provider: &dyn CryptoProvider,
    plaintext: &[u8],
    key: &EncryptionKey,
    chunk_size: u64,
) -> LbxResult<Vec<Vec<u8>>> {
    let plan = plan_chunks(plaintext.len() as u64, chunk_size)?;
    tracing::debug!(chunks = plan.len(), chunk_size, "encrypting chunked payload");
    plan.par_iter()
        .map(|chunk| provider.encrypt(&plaintext[chunk.byte_range()], key))
        .collect()
}

/// Decrypt one chunk blob. Same failure mode as [`crate::aead::decrypt`].
pub fn decrypt_chunk(blob: &[u8], key: &EncryptionKey) -> LbxResult<Vec<u8>> {
    crate::aead::decrypt(blob, key)
}

/// Concatenate decrypted chunks by ascending index.
///
/// Chunks may arrive in any order but must form the contiguous run
/// `0..n` (`Corrupted` otherwise); the joined length must equal
/// `original_size` (`SizeMismatch` otherwise).
pub fn reassemble<I, B>(chunks: I, original_size: u64) -> LbxResult<Vec<u8>>
where
    I: IntoIterator<Item = (u32, B)>,
    B: AsRef<[u8]>,
{
    let mut chunks: Vec<(u32, B)> = chunks.into_iter().collect();
    chunks.sort_by_key(|(index, _)| *index);

    for (expected, (index, _)) in chunks.iter().enumerate() {
        if *index as usize != expected {
            return Err(LbxError::Corrupted(format!(
                "chunk sequence broken at position {expected}: found index {index}"
            )));
        }
    }

    let actual: u64 = chunks.iter().map(|(_, b)| b.as_ref().len() as u64).sum();
    if actual != original_size {
        return Err(LbxError::SizeMismatch {
            expected: original_size,
            actual,
        });
    }

    let mut out = Vec::with_capacity(actual as usize);
    for (_, data) in &chunks {
        out.extend_from_slice(data.as_ref());
    }
    Ok(out)
}
