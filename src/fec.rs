//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Forward error correction over audio datagrams.
//!
//! Every primary packet may be shadowed by copies of prior payloads
//! (REDUNDANT packets) so the receiver can reconstruct a lost sequence
//! without retransmission. The on-wire FEC datagram is a 13-byte
//! little-endian header followed by the payload:
//!
//! ```text
//! [packet_type(1)] [sequence_id(4)] [redundant_sequence_id(4)]
//! [redundant_data_size(2)] [redundancy_level(1)] [reserved(1)]
//! ```

mod decoder;
mod encoder;

use std::convert::TryFrom;

use thiserror::Error;

pub use decoder::{FecDecodeStats, FecDecoder, RecoveryResult};
pub use encoder::{FecEncodeStats, FecEncoder};

use crate::{
    common::{parse_u16_le, parse_u32_le, CheckedSplitAt},
    packet::{sequence_distance, SequenceId},
};

pub const FEC_HEADER_LEN: usize = 13;

pub const MIN_REDUNDANCY_PERCENTAGE: f64 = 0.0;
pub const MAX_REDUNDANCY_PERCENTAGE: f64 = 50.0;
pub const MAX_WINDOW_SIZE: usize = 20;

/// How long primary and redundant copies stay eligible for recovery.
pub(crate) const PACKET_TIMEOUT: crate::common::Duration = crate::common::Duration::from_secs(1);

#[derive(Error, Debug, Eq, PartialEq)]
pub enum FecError {
    #[error("malformed FEC packet of {0} bytes")]
    Malformed(usize),
    #[error("sequence {0} is unrecoverable")]
    Unrecoverable(SequenceId),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum FecPacketType {
    /// Original audio payload, delivered as-is.
    Primary = 0x01,
    /// Full copy of the payload of `redundant_sequence_id`.
    Redundant = 0x02,
}

impl TryFrom<u8> for FecPacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(FecPacketType::Primary),
            0x02 => Ok(FecPacketType::Redundant),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FecHeader {
    pub packet_type: FecPacketType,
    /// The carrier packet's own id.
    pub sequence_id: SequenceId,
    /// For REDUNDANT, the id of the protected prior packet; 0 for PRIMARY.
    pub redundant_sequence_id: SequenceId,
    pub redundant_data_size: u16,
    pub redundancy_level: u8,
    pub reserved: u8,
}

impl FecHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FEC_HEADER_LEN);
        out.push(self.packet_type as u8);
        out.extend_from_slice(&self.sequence_id.to_le_bytes());
        out.extend_from_slice(&self.redundant_sequence_id.to_le_bytes());
        out.extend_from_slice(&self.redundant_data_size.to_le_bytes());
        out.push(self.redundancy_level);
        out.push(self.reserved);
        out
    }

    /// Parses the header and returns it along with the trailing payload.
    pub fn deserialize(input: &[u8]) -> Result<(Self, &[u8]), FecError> {
        let (header, payload) = input
            .checked_split_at(FEC_HEADER_LEN)
            .ok_or(FecError::Malformed(input.len()))?;

        let packet_type =
            FecPacketType::try_from(header[0]).map_err(|_| FecError::Malformed(input.len()))?;
        Ok((
            Self {
                packet_type,
                sequence_id: parse_u32_le(&header[1..5]),
                redundant_sequence_id: parse_u32_le(&header[5..9]),
                redundant_data_size: parse_u16_le(&header[9..11]),
                redundancy_level: header[11],
                reserved: header[12],
            },
            payload,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct FecConfig {
    /// Share of the window protected by redundant copies, 0-50 %.
    pub redundancy_percentage: f64,
    /// Maximum distance (in packets) between a loss and the copy that repairs it.
    pub max_recovery_distance: usize,
    /// Sliding window of recent payloads eligible for protection.
    pub window_size: usize,
    /// Retune `redundancy_percentage` from the network monitor.
    pub adaptive_redundancy: bool,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            redundancy_percentage: 20.0,
            max_recovery_distance: 5,
            window_size: 10,
            adaptive_redundancy: true,
        }
    }
}

impl FecConfig {
    pub(crate) fn clamped(mut self) -> Self {
        self.redundancy_percentage = self
            .redundancy_percentage
            .clamp(MIN_REDUNDANCY_PERCENTAGE, MAX_REDUNDANCY_PERCENTAGE);
        self.window_size = self.window_size.min(MAX_WINDOW_SIZE);
        self
    }
}

/// True iff `sid` lies in the recovery window `[newest - distance, newest]`.
pub(crate) fn in_recovery_window(sid: SequenceId, newest: SequenceId, distance: usize) -> bool {
    let behind = sequence_distance(newest, sid);
    behind >= 0 && behind as usize <= distance
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FecHeader {
        FecHeader {
            packet_type: FecPacketType::Primary,
            sequence_id: 12345,
            redundant_sequence_id: 0,
            redundant_data_size: 256,
            redundancy_level: 20,
            reserved: 0,
        }
    }

    #[test]
    fn header_round_trip() {
        let serialized = header().serialize();
        assert_eq!(FEC_HEADER_LEN, serialized.len());

        let (parsed, payload) = FecHeader::deserialize(&serialized).unwrap();
        assert_eq!(header(), parsed);
        assert!(payload.is_empty());
    }

    #[test]
    fn redundant_header_round_trip() {
        let original = FecHeader {
            packet_type: FecPacketType::Redundant,
            sequence_id: 10,
            redundant_sequence_id: 7,
            redundant_data_size: 120,
            redundancy_level: 50,
            reserved: 0,
        };
        let mut serialized = original.serialize();
        serialized.extend_from_slice(&[1, 2, 3]);

        let (parsed, payload) = FecHeader::deserialize(&serialized).unwrap();
        assert_eq!(original, parsed);
        assert_eq!(&[1, 2, 3], payload);
    }

    #[test]
    fn invalid_packet_type_is_malformed() {
        let mut serialized = header().serialize();
        serialized[0] = 0x03;
        assert_eq!(
            Err(FecError::Malformed(13)),
            FecHeader::deserialize(&serialized)
        );
    }

    #[test]
    fn short_header_is_malformed() {
        assert_eq!(
            Err(FecError::Malformed(12)),
            FecHeader::deserialize(&[1u8; 12])
        );
    }

    #[test]
    fn config_is_clamped() {
        let config = FecConfig {
            redundancy_percentage: 80.0,
            window_size: 64,
            ..Default::default()
        }
        .clamped();
        assert_eq!(50.0, config.redundancy_percentage);
        assert_eq!(MAX_WINDOW_SIZE, config.window_size);

        let config = FecConfig {
            redundancy_percentage: -3.0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(0.0, config.redundancy_percentage);
    }

    #[test]
    fn recovery_window_spans_wrap() {
        assert!(in_recovery_window(10, 10, 5));
        assert!(in_recovery_window(5, 10, 5));
        assert!(!in_recovery_window(4, 10, 5));
        // A "future" sid is outside the window.
        assert!(!in_recovery_window(11, 10, 5));
        // Window straddling the u32 wrap.
        assert!(in_recovery_window(u32::MAX, 2, 5));
        assert!(!in_recovery_window(u32::MAX - 4, 2, 5));
    }
}
