//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::BTreeMap;

use log::*;
use parking_lot::Mutex;

use crate::{
    common::Instant,
    fec::{in_recovery_window, FecError, FecHeader, FecPacketType, PACKET_TIMEOUT},
    packet::{sequence_distance, SequenceId},
};

/// Weight of the newest sample in the recovery-delay average.
const RECOVERY_DELAY_ALPHA: f64 = 0.1;
/// Nominal playout time of one packet, used to express recovery delay in ms.
const PACKET_DURATION_MS: f64 = 2.5;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecoveryResult {
    pub sequence_id: SequenceId,
    pub data: Vec<u8>,
    pub from_redundancy: bool,
    /// The carrier whose redundant copy repaired the loss, when `from_redundancy`.
    pub carrier_sequence_id: Option<SequenceId>,
    /// How many packets after the loss the repairing copy arrived.
    pub recovery_delay_packets: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FecDecodeStats {
    pub primary_packets_received: u64,
    pub redundant_packets_received: u64,
    pub packets_recovered: u64,
    pub recovery_attempts: u64,
    pub recovery_failures: u64,
    pub recovery_success_rate: f64,
    pub packets_lost_unrecoverable: u64,
    pub average_recovery_delay_ms: f64,
    pub max_recovery_delay_packets: u64,
}

struct StoredPacket {
    data: Vec<u8>,
    /// The sequence id of the datagram that carried this payload.
    carrier: SequenceId,
    stored: Instant,
}

struct DecoderState {
    max_recovery_distance: usize,
    /// Primary payloads keyed by their own sequence id.
    primary: BTreeMap<SequenceId, StoredPacket>,
    /// Redundant copies keyed by the protected sequence id.
    /// Several carriers may protect the same sid.
    redundant: BTreeMap<SequenceId, Vec<StoredPacket>>,
    newest: Option<SequenceId>,
    stats: FecDecodeStats,
}

impl DecoderState {
    fn new(max_recovery_distance: usize) -> Self {
        Self {
            max_recovery_distance,
            primary: BTreeMap::new(),
            redundant: BTreeMap::new(),
            newest: None,
            stats: FecDecodeStats::default(),
        }
    }
}

/// Recovers lost sequence ids from stored redundancy.
///
/// Single internal mutex; never held together with any other lock.
pub struct FecDecoder {
    state: Mutex<DecoderState>,
}

impl FecDecoder {
    pub fn new(max_recovery_distance: usize) -> Self {
        Self {
            state: Mutex::new(DecoderState::new(max_recovery_distance)),
        }
    }

    /// Processes one incoming FEC datagram.
    ///
    /// PRIMARY payloads are stored and returned immediately; REDUNDANT copies
    /// are only stored. Entries older than the packet timeout or outside the
    /// recovery window are evicted on every call.
    pub fn process_packet(
        &self,
        packet: &[u8],
        now: Instant,
    ) -> Result<Option<RecoveryResult>, FecError> {
        let (header, payload) = FecHeader::deserialize(packet)?;
        let mut state = self.state.lock();

        let result = match header.packet_type {
            FecPacketType::Primary => {
                state.primary.insert(
                    header.sequence_id,
                    StoredPacket {
                        data: payload.to_vec(),
                        carrier: header.sequence_id,
                        stored: now,
                    },
                );
                state.stats.primary_packets_received += 1;
                Some(RecoveryResult {
                    sequence_id: header.sequence_id,
                    data: payload.to_vec(),
                    from_redundancy: false,
                    carrier_sequence_id: None,
                    recovery_delay_packets: 0,
                })
            }
            FecPacketType::Redundant => {
                state
                    .redundant
                    .entry(header.redundant_sequence_id)
                    .or_default()
                    .push(StoredPacket {
                        data: payload.to_vec(),
                        carrier: header.sequence_id,
                        stored: now,
                    });
                state.stats.redundant_packets_received += 1;
                None
            }
        };

        let newest = match state.newest {
            Some(newest) if sequence_distance(header.sequence_id, newest) <= 0 => newest,
            _ => header.sequence_id,
        };
        state.newest = Some(newest);
        let max_distance = state.max_recovery_distance;
        Self::evict(&mut state, newest, max_distance, now);

        Ok(result)
    }

    /// Returns the stored PRIMARY payload for `sequence_id`, falling back to
    /// the first stored REDUNDANT copy. Fails when neither is available.
    pub fn recover(&self, sequence_id: SequenceId) -> Result<RecoveryResult, FecError> {
        let mut state = self.state.lock();
        state.stats.recovery_attempts += 1;

        if let Some(stored) = state.primary.get(&sequence_id) {
            let data = stored.data.clone();
            return Ok(RecoveryResult {
                sequence_id,
                data,
                from_redundancy: false,
                carrier_sequence_id: None,
                recovery_delay_packets: 0,
            });
        }

        let copy = state
            .redundant
            .get(&sequence_id)
            .and_then(|copies| copies.first())
            .map(|copy| (copy.data.clone(), copy.carrier));
        let (data, carrier) = match copy {
            Some(copy) => copy,
            None => {
                state.stats.recovery_failures += 1;
                state.stats.packets_lost_unrecoverable += 1;
                return Err(FecError::Unrecoverable(sequence_id));
            }
        };

        let delay_packets = sequence_distance(carrier, sequence_id).max(0) as u32;
        state.stats.packets_recovered += 1;
        state.stats.max_recovery_delay_packets =
            state.stats.max_recovery_delay_packets.max(delay_packets as u64);
        if delay_packets > 0 {
            let delay_ms = delay_packets as f64 * PACKET_DURATION_MS;
            state.stats.average_recovery_delay_ms = if state.stats.average_recovery_delay_ms == 0.0
            {
                delay_ms
            } else {
                (1.0 - RECOVERY_DELAY_ALPHA) * state.stats.average_recovery_delay_ms
                    + RECOVERY_DELAY_ALPHA * delay_ms
            };
        }

        trace!(
            "recovered sequence {} from redundancy carried by {}",
            sequence_id,
            carrier
        );
        Ok(RecoveryResult {
            sequence_id,
            data,
            from_redundancy: true,
            carrier_sequence_id: Some(carrier),
            recovery_delay_packets: delay_packets,
        })
    }

    pub fn can_recover(&self, sequence_id: SequenceId) -> bool {
        let state = self.state.lock();
        state.primary.contains_key(&sequence_id)
            || state
                .redundant
                .get(&sequence_id)
                .is_some_and(|copies| !copies.is_empty())
    }

    /// All sequence ids for which either a primary or a redundant copy is stored.
    pub fn recoverable_sids(&self) -> Vec<SequenceId> {
        let state = self.state.lock();
        let mut sids: Vec<SequenceId> = state
            .primary
            .keys()
            .chain(state.redundant.keys())
            .copied()
            .collect();
        sids.sort_unstable();
        sids.dedup();
        sids
    }

    pub fn stats(&self) -> FecDecodeStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        if stats.recovery_attempts > 0 {
            stats.recovery_success_rate =
                stats.packets_recovered as f64 / stats.recovery_attempts as f64 * 100.0;
        }
        stats
    }

    pub fn set_max_recovery_distance(&self, max_distance: usize) {
        self.state.lock().max_recovery_distance = max_distance;
    }

    pub fn max_recovery_distance(&self) -> usize {
        self.state.lock().max_recovery_distance
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = DecoderState::new(state.max_recovery_distance);
    }

    fn evict(state: &mut DecoderState, newest: SequenceId, max_distance: usize, now: Instant) {
        state.primary.retain(|sid, stored| {
            in_recovery_window(*sid, newest, max_distance)
                && now.saturating_duration_since(stored.stored) <= PACKET_TIMEOUT
        });
        state.redundant.retain(|sid, copies| {
            if !in_recovery_window(*sid, newest, max_distance) {
                return false;
            }
            copies.retain(|copy| now.saturating_duration_since(copy.stored) <= PACKET_TIMEOUT);
            !copies.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Duration;
    use crate::fec::{FecConfig, FecEncoder};

    fn primary(sid: SequenceId, payload: &[u8]) -> Vec<u8> {
        let mut packet = FecHeader {
            packet_type: FecPacketType::Primary,
            sequence_id: sid,
            redundant_sequence_id: 0,
            redundant_data_size: 0,
            redundancy_level: 50,
            reserved: 0,
        }
        .serialize();
        packet.extend_from_slice(payload);
        packet
    }

    fn redundant(carrier: SequenceId, protects: SequenceId, payload: &[u8]) -> Vec<u8> {
        let mut packet = FecHeader {
            packet_type: FecPacketType::Redundant,
            sequence_id: carrier,
            redundant_sequence_id: protects,
            redundant_data_size: payload.len() as u16,
            redundancy_level: 50,
            reserved: 0,
        }
        .serialize();
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn primary_is_returned_immediately() {
        let decoder = FecDecoder::new(5);
        let result = decoder
            .process_packet(&primary(1, b"one"), Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(1, result.sequence_id);
        assert_eq!(b"one".to_vec(), result.data);
        assert!(!result.from_redundancy);
    }

    #[test]
    fn redundant_yields_no_immediate_data() {
        let decoder = FecDecoder::new(5);
        let result = decoder
            .process_packet(&redundant(3, 2, b"two"), Instant::now())
            .unwrap();
        assert_eq!(None, result);
        assert_eq!(1, decoder.stats().redundant_packets_received);
    }

    #[test]
    fn malformed_packet_is_rejected() {
        let decoder = FecDecoder::new(5);
        assert_eq!(
            Err(FecError::Malformed(3)),
            decoder.process_packet(&[1, 2, 3], Instant::now())
        );
        let mut bad_type = primary(1, b"x");
        bad_type[0] = 0x7F;
        assert!(decoder.process_packet(&bad_type, Instant::now()).is_err());
    }

    #[test]
    fn recovers_lost_packet_from_redundancy() {
        let decoder = FecDecoder::new(5);
        let now = Instant::now();

        // Packet 2 is lost on the wire; its copy rides on packet 3.
        decoder.process_packet(&primary(1, b"one"), now).unwrap();
        decoder.process_packet(&primary(3, b"three"), now).unwrap();
        decoder.process_packet(&redundant(3, 2, b"two"), now).unwrap();

        let result = decoder.recover(2).unwrap();
        assert!(result.from_redundancy);
        assert_eq!(b"two".to_vec(), result.data);
        assert_eq!(Some(3), result.carrier_sequence_id);
        assert_eq!(1, result.recovery_delay_packets);

        let stats = decoder.stats();
        assert_eq!(1, stats.packets_recovered);
        assert_eq!(1, stats.recovery_attempts);
        assert_eq!(100.0, stats.recovery_success_rate);
        assert_eq!(1, stats.max_recovery_delay_packets);
        assert_eq!(2.5, stats.average_recovery_delay_ms);
    }

    #[test]
    fn stored_primary_recovers_without_redundancy() {
        let decoder = FecDecoder::new(5);
        let now = Instant::now();
        decoder.process_packet(&primary(7, b"seven"), now).unwrap();
        decoder.process_packet(&redundant(8, 7, b"seven"), now).unwrap();

        let result = decoder.recover(7).unwrap();
        assert!(!result.from_redundancy);
        assert_eq!(b"seven".to_vec(), result.data);
    }

    #[test]
    fn unrecoverable_when_nothing_is_stored() {
        let decoder = FecDecoder::new(5);
        decoder
            .process_packet(&primary(10, b"ten"), Instant::now())
            .unwrap();

        assert_eq!(Err(FecError::Unrecoverable(9)), decoder.recover(9));
        let stats = decoder.stats();
        assert_eq!(1, stats.recovery_failures);
        assert_eq!(1, stats.packets_lost_unrecoverable);
        assert_eq!(0.0, stats.recovery_success_rate);
    }

    #[test]
    fn window_advance_evicts_old_sequences() {
        let decoder = FecDecoder::new(3);
        let now = Instant::now();
        decoder.process_packet(&primary(1, b"one"), now).unwrap();
        decoder.process_packet(&redundant(2, 1, b"one"), now).unwrap();
        assert!(decoder.can_recover(1));

        // Advancing the newest sid past 1 + max_recovery_distance drops
        // both the primary and the redundant copy.
        decoder.process_packet(&primary(5, b"five"), now).unwrap();
        assert!(!decoder.can_recover(1));
        assert_eq!(Err(FecError::Unrecoverable(1)), decoder.recover(1));
    }

    #[test]
    fn stale_entries_are_evicted_by_time() {
        let decoder = FecDecoder::new(50);
        let start = Instant::now();
        decoder.process_packet(&primary(1, b"one"), start).unwrap();
        assert!(decoder.can_recover(1));

        let later = start + Duration::from_millis(1500);
        decoder.process_packet(&primary(2, b"two"), later).unwrap();
        assert!(!decoder.can_recover(1));
        assert!(decoder.can_recover(2));
    }

    #[test]
    fn multiple_redundant_copies_use_first() {
        let decoder = FecDecoder::new(5);
        let now = Instant::now();
        decoder.process_packet(&redundant(3, 2, b"copy-a"), now).unwrap();
        decoder.process_packet(&redundant(4, 2, b"copy-b"), now).unwrap();

        let result = decoder.recover(2).unwrap();
        assert_eq!(b"copy-a".to_vec(), result.data);
        assert_eq!(Some(3), result.carrier_sequence_id);
    }

    #[test]
    fn recoverable_sids_are_sorted_and_deduped() {
        let decoder = FecDecoder::new(10);
        let now = Instant::now();
        decoder.process_packet(&primary(5, b"five"), now).unwrap();
        decoder.process_packet(&redundant(6, 5, b"five"), now).unwrap();
        decoder.process_packet(&redundant(6, 4, b"four"), now).unwrap();

        assert_eq!(vec![4, 5], decoder.recoverable_sids());
    }

    #[test]
    fn reset_clears_state() {
        let decoder = FecDecoder::new(5);
        decoder
            .process_packet(&primary(1, b"one"), Instant::now())
            .unwrap();
        decoder.reset();
        assert!(!decoder.can_recover(1));
        assert_eq!(0, decoder.stats().primary_packets_received);
    }

    #[test]
    fn end_to_end_with_encoder() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut encoder = FecEncoder::new(FecConfig {
            redundancy_percentage: 50.0,
            ..Default::default()
        });
        let decoder = FecDecoder::new(5);
        let now = Instant::now();

        let batch1 = encoder.encode_packet(1, b"one", now);
        let batch2 = encoder.encode_packet(2, b"two", now);
        let batch3 = encoder.encode_packet(3, b"three", now);

        // Deliver packet 1 fully, drop every copy of packet 2 except the
        // redundant one riding on packet 3's batch.
        decoder.process_packet(&batch1[0], now).unwrap();
        drop(batch2);
        for packet in &batch3 {
            decoder.process_packet(packet, now).unwrap();
        }

        let result = decoder.recover(2).unwrap();
        assert!(result.from_redundancy);
        assert_eq!(b"two".to_vec(), result.data);
    }
}
