//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! On-wire layout of the audio datagram:
//! a fixed 16-byte little-endian header followed by the compressed payload.
//!
//! ```text
//! [sequence_id(4)] [timestamp(8)] [payload_size(4)] [payload(variable)]
//! ```

use thiserror::Error;

use crate::common::{parse_u32_le, parse_u64_le, CheckedSplitAt};

pub type SequenceId = u32;

/// Signed modular distance between two sequence ids, so comparisons keep
/// working across the u32 wrap.
pub fn sequence_distance(a: SequenceId, b: SequenceId) -> i32 {
    a.wrapping_sub(b) as i32
}

pub const HEADER_LEN: usize = 16;
pub const MAX_PAYLOAD_LEN: usize = 1500;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum PacketError {
    #[error("malformed packet of {0} bytes")]
    Malformed(usize),
}

/// One audio datagram: a compressed frame stamped with the sender's
/// capture time (microseconds) and a per-stream sequence id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AudioPacket {
    pub sequence_id: SequenceId,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl AudioPacket {
    pub fn new(sequence_id: SequenceId, timestamp: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence_id,
            timestamp,
            payload,
        }
    }

    pub fn total_size(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        out.extend_from_slice(&self.sequence_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses a datagram. Trailing bytes beyond `payload_size` are ignored;
    /// a short header or a `payload_size` past the end of the input is malformed.
    pub fn deserialize(input: &[u8]) -> Result<Self, PacketError> {
        let (header, rest) = input
            .checked_split_at(HEADER_LEN)
            .ok_or(PacketError::Malformed(input.len()))?;

        let sequence_id = parse_u32_le(&header[0..4]);
        let timestamp = parse_u64_le(&header[4..12]);
        let payload_size = parse_u32_le(&header[12..16]) as usize;

        if payload_size > MAX_PAYLOAD_LEN {
            return Err(PacketError::Malformed(input.len()));
        }
        let (payload, _) = rest
            .checked_split_at(payload_size)
            .ok_or(PacketError::Malformed(input.len()))?;

        Ok(Self {
            sequence_id,
            timestamp,
            payload: payload.to_vec(),
        })
    }
}
