// rust/runtime-core/src/collective/message.rs

//! Peer-to-peer wire messages and their framing.
//!
//! A frame is a u32 little-endian length followed by a bincode-encoded
//! [`PeerMessage`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::state::Gradients;

/// Largest accepted frame body. Guards against allocating for a garbage
/// length prefix.
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Who sent a message: worker index, cluster fingerprint and the sender's
/// process incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub worker: usize,
    pub fingerprint: u64,
    pub incarnation: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First frame on every new connection.
    Hello { origin: Origin, step: u64 },
    Heartbeat { origin: Origin, step: u64 },
    /// A worker's gradients for one step. `timeline` counts the sender's
    /// resynchronizations; gradients from different timelines never mix.
    Contribution {
        origin: Origin,
        timeline: u64,
        step: u64,
        gradients: Gradients,
    },
}

impl PeerMessage {
    pub fn origin(&self) -> &Origin {
        match self {
            Self::Hello { origin, .. }
            | Self::Heartbeat { origin, .. }
            | Self::Contribution { origin, .. } => origin,
        }
    }

    pub fn step(&self) -> u64 {
        match self {
            Self::Hello { step, .. }
            | Self::Heartbeat { step, .. }
            | Self::Contribution { step, .. } => *step,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Contribution { .. } => "contribution",
        }
    }
}

/// A peer's contribution, as delivered to the collective channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub from: usize,
    pub timeline: u64,
    pub step: u64,
    pub gradients: Gradients,
}

impl Contribution {
    /// Extracts the contribution carried by `message`, if any.
    pub fn from_message(message: PeerMessage) -> Option<Self> {
        match message {
            PeerMessage::Contribution {
                origin,
                timeline,
                step,
                gradients,
            } => Some(Self {
                from: origin.worker,
                timeline,
                step,
                gradients,
            }),
            _ => None,
        }
    }
}

/// Encodes a message as a length-prefixed frame.
pub fn encode_frame(message: &PeerMessage) -> Result<Vec<u8>> {
    let body = bincode::serialize(message)
        .map_err(|e| RuntimeError::serialization(format!("failed to encode {}: {e}", message.kind())))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RuntimeError::transport(format!(
            "{} frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit",
            message.kind(),
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Validates a frame length prefix.
pub fn frame_len(prefix: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RuntimeError::transport(format!(
            "frame length {len} exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }
    Ok(len)
}

/// Decodes a frame body (without its length prefix).
pub fn decode_body(body: &[u8]) -> Result<PeerMessage> {
    bincode::deserialize(body)
        .map_err(|e| RuntimeError::serialization(format!("failed to decode peer message: {e}")))
}
