// rust/runtime-core/src/checkpoint/format.rs

//! Checkpoint file format.
//!
//! ```text
//! +------------------------+
//! | Header Length (4 bytes)|  <- u32 little-endian
//! +------------------------+
//! | Header (bincode)       |  <- CheckpointHeader
//! +------------------------+
//! | Compressed Payload     |  <- bincode TrainingState, compressed per header
//! +------------------------+
//! ```
//!
//! The checksum covers the uncompressed payload, so a file that decodes is
//! byte-for-byte the state that was published.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::{Result, RuntimeError};
use crate::state::TrainingState;

/// Payload compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

impl FromStr for Compression {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(RuntimeError::config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        })
    }
}

/// Header for a checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Magic bytes identifying this as a checkpoint file ("STCK")
    pub magic: [u8; 4],
    pub version: u32,
    /// Generation this file was published as; must match its directory.
    pub generation: u64,
    pub step: u64,
    pub epoch: u64,
    pub compression: Compression,
    pub uncompressed_size: u64,
    /// XXHash64 of the uncompressed payload
    pub checksum: u64,
    /// Publish time, milliseconds since the Unix epoch.
    pub created_at_ms: i64,
    pub metadata: BTreeMap<String, String>,
}

impl CheckpointHeader {
    pub const MAGIC: [u8; 4] = *b"STCK";
    pub const VERSION: u32 = 1;
}

fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Serializes a training state into a checkpoint file image.
pub fn encode_checkpoint(
    generation: u64,
    state: &TrainingState,
    compression: Compression,
    compression_level: i32,
    metadata: BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state).map_err(|e| {
        RuntimeError::serialization(format!("failed to serialize training state: {e}"))
    })?;

    let compressed = match compression {
        Compression::None => payload.clone(),
        Compression::Lz4 => lz4_flex::compress_prepend_size(&payload),
        Compression::Zstd => zstd::encode_all(payload.as_slice(), compression_level)
            .map_err(|e| RuntimeError::checkpoint_with_source("zstd compression failed", e))?,
    };

    let header = CheckpointHeader {
        magic: CheckpointHeader::MAGIC,
        version: CheckpointHeader::VERSION,
        generation,
        step: state.step,
        epoch: state.epoch,
        compression,
        uncompressed_size: payload.len() as u64,
        checksum: checksum(&payload),
        created_at_ms: chrono::Utc::now().timestamp_millis(),
        metadata,
    };
    let header_bytes = bincode::serialize(&header)
        .map_err(|e| RuntimeError::serialization(format!("failed to serialize header: {e}")))?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Parses and verifies only the header of a checkpoint file image.
pub fn decode_header(generation: u64, bytes: &[u8]) -> Result<(CheckpointHeader, usize)> {
    let corrupt = |msg: String| RuntimeError::corrupt(generation, msg);

    let len_bytes: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| corrupt(format!("file too small ({} bytes)", bytes.len())))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let payload_start = 4usize
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| corrupt("truncated header".to_string()))?;

    let header: CheckpointHeader = bincode::deserialize(&bytes[4..payload_start])
        .map_err(|e| corrupt(format!("undecodable header: {e}")))?;

    if header.magic != CheckpointHeader::MAGIC {
        return Err(corrupt(format!("invalid magic bytes {:?}", header.magic)));
    }
    if header.version != CheckpointHeader::VERSION {
        return Err(corrupt(format!(
            "unsupported version {}, expected {}",
            header.version,
            CheckpointHeader::VERSION
        )));
    }
    if header.generation != generation {
        return Err(corrupt(format!(
            "header names generation {}",
            header.generation
        )));
    }

    Ok((header, payload_start))
}

/// Parses a checkpoint file image, verifying its header, size and checksum.
///
/// Every failure is reported as `CheckpointCorrupt` for `generation`.
pub fn decode_checkpoint(generation: u64, bytes: &[u8]) -> Result<(CheckpointHeader, TrainingState)> {
    let corrupt = |msg: String| RuntimeError::corrupt(generation, msg);
    let (header, payload_start) = decode_header(generation, bytes)?;
    let compressed = &bytes[payload_start..];

    let payload = match header.compression {
        Compression::None => compressed.to_vec(),
        Compression::Lz4 => {
            // Check the size prefix before lz4_flex allocates for it.
            let declared = compressed
                .get(..4)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| corrupt("truncated lz4 payload".to_string()))?;
            if u64::from(declared) != header.uncompressed_size {
                return Err(corrupt(format!(
                    "lz4 size prefix {declared} does not match header size {}",
                    header.uncompressed_size
                )));
            }
            lz4_flex::decompress_size_prepended(compressed)
                .map_err(|e| corrupt(format!("lz4 decompression failed: {e}")))?
        }
        Compression::Zstd => zstd::decode_all(compressed)
            .map_err(|e| corrupt(format!("zstd decompression failed: {e}")))?,
    };

    if payload.len() as u64 != header.uncompressed_size {
        return Err(corrupt(format!(
            "size mismatch: expected {}, got {}",
            header.uncompressed_size,
            payload.len()
        )));
    }
    let computed = checksum(&payload);
    if computed != header.checksum {
        return Err(corrupt(format!(
            "checksum mismatch: expected {:016x}, got {computed:016x}",
            header.checksum
        )));
    }

    let state: TrainingState = bincode::deserialize(&payload)
        .map_err(|e| corrupt(format!("undecodable training state: {e}")))?;
    if state.step != header.step || state.epoch != header.epoch {
        return Err(corrupt(format!(
            "state is at step {} epoch {}, header says step {} epoch {}",
            state.step, state.epoch, header.step, header.epoch
        )));
    }

    Ok((header, state))
}
