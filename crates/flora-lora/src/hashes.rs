//! Integrity hashes written into adapter file metadata.
//!
//! Both hashes are taken over a safetensors serialization of the weights
//! whose metadata keeps only the `ss_*` training keys, so they identify the
//! tensor payload independent of the hash fields themselves.

use sha2::{Digest, Sha256};

use crate::{LoraError, Result};

/// Metadata key of the payload hash.
pub const MODEL_HASH_KEY: &str = "sshs_model_hash";

/// Metadata key of the legacy hash.
pub const LEGACY_HASH_KEY: &str = "sshs_legacy_hash";

const LEGACY_OFFSET: usize = 0x100000;
const LEGACY_LEN: usize = 0x10000;

/// SHA-256 (hex) of everything after the safetensors header.
pub fn model_hash(serialized: &[u8]) -> Result<String> {
    let len_bytes: [u8; 8] = serialized
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| LoraError::InvalidState("safetensors buffer too short".into()))?;
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    let payload = serialized
        .get(8 + header_len..)
        .ok_or_else(|| LoraError::InvalidState("safetensors header exceeds buffer".into()))?;

    let mut hasher = Sha256::new();
    hasher.update(payload);
    Ok(format!("{:x}", hasher.finalize()))
}

/// First 8 hex digits of SHA-256 over bytes `0x100000..0x110000`.
///
/// Shorter buffers hash whatever part of the window exists.
pub fn legacy_hash(serialized: &[u8]) -> String {
    let start = LEGACY_OFFSET.min(serialized.len());
    let end = (LEGACY_OFFSET + LEGACY_LEN).min(serialized.len());
    let mut hasher = Sha256::new();
    hasher.update(&serialized[start..end]);
    let hex = format!("{:x}", hasher.finalize());
    hex[..8].to_string()
}
