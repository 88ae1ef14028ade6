//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Sequence-ordered reorder buffer for decoded audio frames.
//!
//! Masks network reordering by keying frames on their sequence id and
//! always releasing the smallest stored id first.

pub mod adaptive;

use std::collections::BTreeMap;

use log::*;
use thiserror::Error;

use crate::packet::{sequence_distance, SequenceId};

pub const MIN_CAPACITY: usize = 1;
pub const MAX_CAPACITY: usize = 20;
pub const MIN_FRAME_SIZE: usize = 64;
pub const MAX_FRAME_SIZE: usize = 1024;
pub const MIN_CHANNELS: usize = 1;
pub const MAX_CHANNELS: usize = 2;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum JitterError {
    #[error("invalid jitter buffer config: {0}")]
    InvalidConfig(&'static str),
    #[error("capacity {0} outside configured bounds")]
    InvalidCapacity(usize),
    #[error("pcm frame has {got} samples, expected {expected}")]
    MalformedFrame { got: usize, expected: usize },
    #[error("duplicate sequence {0}")]
    Duplicate(SequenceId),
    #[error("sequence {0} arrived after its playout slot")]
    Late(SequenceId),
}

/// One buffered frame: decoded PCM stamped with its origin packet's
/// sequence id and sender timestamp (microseconds).
#[derive(Debug, Clone, PartialEq)]
pub struct JitterEntry {
    pub sequence_id: SequenceId,
    pub timestamp: u64,
    pub pcm: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct JitterStats {
    pub packets_added: u64,
    pub packets_retrieved: u64,
    pub packets_dropped: u64,
    pub duplicates_dropped: u64,
    /// Mean inter-packet timestamp delta in milliseconds.
    pub average_jitter_ms: f64,
    pub max_sequence_gap: u32,
}

/// The reorder primitive. Not internally synchronized; the adaptive
/// wrapper owns it behind a mutex.
pub struct JitterBuffer {
    capacity: usize,
    frame_size: usize,
    channels: usize,

    entries: BTreeMap<SequenceId, JitterEntry>,
    /// One past the last sequence id handed out by `pop`.
    next_expected: Option<SequenceId>,

    packets_added: u64,
    packets_retrieved: u64,
    packets_dropped: u64,
    duplicates_dropped: u64,

    last_timestamp: u64,
    jitter_sum_ms: f64,
    jitter_count: u64,
    max_sequence_gap: u32,
}

impl JitterBuffer {
    pub fn new(capacity: usize, frame_size: usize, channels: usize) -> Result<Self, JitterError> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(JitterError::InvalidConfig("capacity out of range"));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&frame_size) {
            return Err(JitterError::InvalidConfig("frame size out of range"));
        }
        if !(MIN_CHANNELS..=MAX_CHANNELS).contains(&channels) {
            return Err(JitterError::InvalidConfig("channel count out of range"));
        }
        Ok(Self {
            capacity,
            frame_size,
            channels,
            entries: BTreeMap::new(),
            next_expected: None,
            packets_added: 0,
            packets_retrieved: 0,
            packets_dropped: 0,
            duplicates_dropped: 0,
            last_timestamp: 0,
            jitter_sum_ms: 0.0,
            jitter_count: 0,
            max_sequence_gap: 0,
        })
    }

    /// Admits one decoded frame. Rejects duplicates and frames that arrive
    /// after their sequence id has already been played out; evicts the
    /// smallest stored id when full.
    pub fn add(
        &mut self,
        sequence_id: SequenceId,
        timestamp: u64,
        pcm: Vec<f32>,
    ) -> Result<(), JitterError> {
        let expected = self.frame_size * self.channels;
        if pcm.len() != expected {
            return Err(JitterError::MalformedFrame {
                got: pcm.len(),
                expected,
            });
        }

        if let Some(next_expected) = self.next_expected {
            if sequence_distance(sequence_id, next_expected) < 0 {
                self.packets_dropped += 1;
                return Err(JitterError::Late(sequence_id));
            }
        }

        if self.entries.contains_key(&sequence_id) {
            self.duplicates_dropped += 1;
            return Err(JitterError::Duplicate(sequence_id));
        }

        if self.entries.len() >= self.capacity {
            if let Some((evicted, _)) = self.entries.pop_first() {
                trace!("reorder buffer full, evicting sequence {}", evicted);
                self.packets_dropped += 1;
            }
        }

        self.update_jitter_stats(timestamp);
        if self.packets_added > 0 {
            if let Some(next_expected) = self.next_expected {
                let gap = sequence_distance(sequence_id, next_expected).max(0) as u32;
                self.max_sequence_gap = self.max_sequence_gap.max(gap);
            }
        }

        self.entries.insert(
            sequence_id,
            JitterEntry {
                sequence_id,
                timestamp,
                pcm,
            },
        );
        self.packets_added += 1;
        Ok(())
    }

    /// Removes and returns the entry with the smallest sequence id.
    pub fn pop(&mut self) -> Option<JitterEntry> {
        let (sequence_id, entry) = self.entries.pop_first()?;
        self.next_expected = Some(sequence_id.wrapping_add(1));
        self.packets_retrieved += 1;
        Some(entry)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_expected = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            packets_added: self.packets_added,
            packets_retrieved: self.packets_retrieved,
            packets_dropped: self.packets_dropped,
            duplicates_dropped: self.duplicates_dropped,
            average_jitter_ms: if self.jitter_count > 0 {
                self.jitter_sum_ms / self.jitter_count as f64
            } else {
                0.0
            },
            max_sequence_gap: self.max_sequence_gap,
        }
    }

    /// Swaps in a buffer of the new capacity, migrating every stored entry
    /// in sequence order. The multiset of entries is unchanged unless the
    /// new capacity is below the stored count, in which case the smallest
    /// ids are evicted (and counted as drops).
    pub(crate) fn migrate(&mut self, new_capacity: usize) -> Result<(), JitterError> {
        let mut migrated = JitterBuffer::new(new_capacity, self.frame_size, self.channels)?;
        migrated.entries = std::mem::take(&mut self.entries);
        while migrated.entries.len() > new_capacity {
            migrated.entries.pop_first();
            migrated.packets_dropped += 1;
        }
        migrated.next_expected = self.next_expected;
        migrated.packets_added = self.packets_added;
        migrated.packets_retrieved = self.packets_retrieved;
        migrated.packets_dropped += self.packets_dropped;
        migrated.duplicates_dropped = self.duplicates_dropped;
        migrated.last_timestamp = self.last_timestamp;
        migrated.jitter_sum_ms = self.jitter_sum_ms;
        migrated.jitter_count = self.jitter_count;
        migrated.max_sequence_gap = self.max_sequence_gap;
        *self = migrated;
        Ok(())
    }

    fn update_jitter_stats(&mut self, timestamp: u64) {
        if self.last_timestamp != 0 {
            let delta_us = timestamp.abs_diff(self.last_timestamp);
            self.jitter_sum_ms += delta_us as f64 / 1000.0;
            self.jitter_count += 1;
        }
        self.last_timestamp = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fill: f32) -> Vec<f32> {
        vec![fill; 120 * 2]
    }

    fn buffer(capacity: usize) -> JitterBuffer {
        JitterBuffer::new(capacity, 120, 2).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(JitterBuffer::new(0, 120, 2).is_err());
        assert!(JitterBuffer::new(21, 120, 2).is_err());
        assert!(JitterBuffer::new(5, 32, 2).is_err());
        assert!(JitterBuffer::new(5, 2048, 2).is_err());
        assert!(JitterBuffer::new(5, 120, 0).is_err());
        assert!(JitterBuffer::new(5, 120, 3).is_err());
        assert!(JitterBuffer::new(5, 120, 2).is_ok());
    }

    #[test]
    fn pops_in_sequence_order() {
        let mut buffer = buffer(5);
        buffer.add(3, 300, frame(0.3)).unwrap();
        buffer.add(1, 100, frame(0.1)).unwrap();
        buffer.add(2, 200, frame(0.2)).unwrap();

        let popped: Vec<SequenceId> = std::iter::from_fn(|| buffer.pop())
            .map(|entry| entry.sequence_id)
            .collect();
        assert_eq!(vec![1, 2, 3], popped);
        assert_eq!(3, buffer.stats().packets_retrieved);
    }

    #[test]
    fn pop_returns_payload_and_timestamp() {
        let mut buffer = buffer(5);
        buffer.add(9, 900, frame(0.9)).unwrap();
        let entry = buffer.pop().unwrap();
        assert_eq!(9, entry.sequence_id);
        assert_eq!(900, entry.timestamp);
        assert_eq!(frame(0.9), entry.pcm);
        assert_eq!(None, buffer.pop());
    }

    #[test]
    fn overflow_evicts_smallest_sequence() {
        let mut buffer = buffer(2);
        buffer.add(1, 100, frame(0.1)).unwrap();
        buffer.add(2, 200, frame(0.2)).unwrap();
        buffer.add(3, 300, frame(0.3)).unwrap();

        assert_eq!(2, buffer.pop().unwrap().sequence_id);
        assert_eq!(3, buffer.pop().unwrap().sequence_id);
        assert_eq!(1, buffer.stats().packets_dropped);
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut buffer = buffer(5);
        buffer.add(1, 100, frame(0.1)).unwrap();
        assert_eq!(
            Err(JitterError::Duplicate(1)),
            buffer.add(1, 100, frame(0.1))
        );
        assert_eq!(1, buffer.stats().duplicates_dropped);
        assert_eq!(1, buffer.len());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let mut buffer = buffer(5);
        assert_eq!(
            Err(JitterError::MalformedFrame {
                got: 3,
                expected: 240
            }),
            buffer.add(1, 100, vec![0.0; 3])
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn late_arrivals_are_dropped() {
        let mut buffer = buffer(5);
        buffer.add(1, 100, frame(0.1)).unwrap();
        buffer.add(3, 300, frame(0.3)).unwrap();
        buffer.pop().unwrap();
        buffer.pop().unwrap();

        // Sequence 2 shows up after 3 has already been played out.
        assert_eq!(Err(JitterError::Late(2)), buffer.add(2, 200, frame(0.2)));
        assert_eq!(1, buffer.stats().packets_dropped);
    }

    #[test]
    fn pops_stay_strictly_increasing() {
        let mut buffer = buffer(3);
        let mut popped = Vec::new();
        let adds: [&[SequenceId]; 3] = [&[5, 2], &[9, 3, 7], &[4, 11]];
        for batch in adds {
            for &sid in batch {
                let _ = buffer.add(sid, sid as u64 * 1000, frame(0.0));
            }
            while let Some(entry) = buffer.pop() {
                popped.push(entry.sequence_id);
            }
        }
        let mut sorted = popped.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, popped);
    }

    #[test]
    fn random_admission_order_still_pops_sorted() {
        use rand::seq::SliceRandom;

        let mut sids: Vec<SequenceId> = (1..=20).collect();
        sids.shuffle(&mut rand::thread_rng());

        let mut buffer = JitterBuffer::new(20, 120, 2).unwrap();
        for &sid in &sids {
            buffer.add(sid, sid as u64 * 2500, frame(0.0)).unwrap();
        }

        let popped: Vec<SequenceId> = std::iter::from_fn(|| buffer.pop())
            .map(|entry| entry.sequence_id)
            .collect();
        assert_eq!((1..=20).collect::<Vec<_>>(), popped);
    }

    #[test]
    fn tracks_sequence_gaps() {
        let mut buffer = buffer(5);
        buffer.add(1, 100, frame(0.1)).unwrap();
        buffer.pop().unwrap();
        buffer.add(6, 600, frame(0.6)).unwrap();
        assert_eq!(4, buffer.stats().max_sequence_gap);
    }

    #[test]
    fn accumulates_timestamp_jitter() {
        let mut buffer = buffer(5);
        buffer.add(1, 10_000, frame(0.1)).unwrap();
        buffer.add(2, 12_500, frame(0.2)).unwrap();
        buffer.add(3, 15_000, frame(0.3)).unwrap();
        // Two deltas of 2.5 ms each.
        assert_eq!(2.5, buffer.stats().average_jitter_ms);
    }

    #[test]
    fn migrate_keeps_entries_and_stats() {
        let mut buffer = buffer(5);
        buffer.add(2, 200, frame(0.2)).unwrap();
        buffer.add(1, 100, frame(0.1)).unwrap();
        buffer.add(3, 300, frame(0.3)).unwrap();

        buffer.migrate(10).unwrap();
        assert_eq!(10, buffer.capacity());
        assert_eq!(3, buffer.len());
        assert_eq!(3, buffer.stats().packets_added);
        assert_eq!(1, buffer.pop().unwrap().sequence_id);
        assert_eq!(2, buffer.pop().unwrap().sequence_id);
        assert_eq!(3, buffer.pop().unwrap().sequence_id);
    }

    #[test]
    fn migrate_shrink_evicts_smallest() {
        let mut buffer = buffer(5);
        for sid in 1..=5 {
            buffer.add(sid, sid as u64 * 100, frame(0.0)).unwrap();
        }
        buffer.migrate(2).unwrap();
        assert_eq!(2, buffer.len());
        assert_eq!(3, buffer.stats().packets_dropped);
        assert_eq!(4, buffer.pop().unwrap().sequence_id);
        assert_eq!(5, buffer.pop().unwrap().sequence_id);
    }
}
