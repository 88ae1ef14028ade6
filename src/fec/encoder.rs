//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::VecDeque;

use log::*;

use crate::{
    common::Instant,
    fec::{
        FecConfig, FecHeader, FecPacketType, MAX_REDUNDANCY_PERCENTAGE,
        MIN_REDUNDANCY_PERCENTAGE, PACKET_TIMEOUT,
    },
    packet::SequenceId,
};

#[derive(Debug, Clone, Default)]
pub struct FecEncodeStats {
    pub primary_packets_encoded: u64,
    pub redundant_packets_generated: u64,
    pub current_redundancy_percentage: f64,
    /// Redundant packets actually emitted per primary, as a percentage.
    pub average_redundancy_percentage: f64,
    pub current_window_size: usize,
}

struct WindowEntry {
    sequence_id: SequenceId,
    payload: Vec<u8>,
    added: Instant,
}

/// Emits each payload as a PRIMARY packet plus redundant copies of
/// prior window entries, sized by the configured redundancy percentage.
pub struct FecEncoder {
    config: FecConfig,
    window: VecDeque<WindowEntry>,
    stats: FecEncodeStats,
}

impl FecEncoder {
    pub fn new(config: FecConfig) -> Self {
        let config = config.clamped();
        let stats = FecEncodeStats {
            current_redundancy_percentage: config.redundancy_percentage,
            ..Default::default()
        };
        Self {
            config,
            window: VecDeque::new(),
            stats,
        }
    }

    /// Encodes one audio payload. The first returned packet is always the
    /// PRIMARY; any further packets are REDUNDANT copies of prior payloads.
    pub fn encode_packet(
        &mut self,
        sequence_id: SequenceId,
        payload: &[u8],
        now: Instant,
    ) -> Vec<Vec<u8>> {
        let mut packets = vec![self.build_packet(
            FecPacketType::Primary,
            sequence_id,
            0,
            0,
            payload,
        )];

        self.window.push_back(WindowEntry {
            sequence_id,
            payload: payload.to_vec(),
            added: now,
        });
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }

        for protected in self.protected_entries() {
            packets.push(self.build_packet(
                FecPacketType::Redundant,
                sequence_id,
                protected.sequence_id,
                protected.payload.len() as u16,
                &protected.payload,
            ));
        }

        self.stats.primary_packets_encoded += 1;
        self.stats.redundant_packets_generated += (packets.len() - 1) as u64;
        self.stats.average_redundancy_percentage = self.stats.redundant_packets_generated as f64
            / self.stats.primary_packets_encoded as f64
            * 100.0;
        self.stats.current_window_size = self.window.len();

        self.window
            .retain(|entry| now.saturating_duration_since(entry.added) <= PACKET_TIMEOUT);

        packets
    }

    /// The i-th most recent entries before the one just added,
    /// up to the redundant packet budget.
    fn protected_entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.window
            .iter()
            .rev()
            .skip(1)
            .take(self.redundant_packet_count())
    }

    fn redundant_packet_count(&self) -> usize {
        if self.config.redundancy_percentage <= 0.0 || self.window.len() < 2 {
            return 0;
        }
        let budget =
            (self.config.redundancy_percentage / 100.0 * self.config.window_size as f64).ceil();
        (budget as usize)
            .min(self.window.len() - 1)
            .min(self.config.max_recovery_distance)
    }

    fn build_packet(
        &self,
        packet_type: FecPacketType,
        sequence_id: SequenceId,
        redundant_sequence_id: SequenceId,
        redundant_data_size: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let header = FecHeader {
            packet_type,
            sequence_id,
            redundant_sequence_id,
            redundant_data_size,
            redundancy_level: self.config.redundancy_percentage as u8,
            reserved: 0,
        };
        let mut packet = header.serialize();
        packet.extend_from_slice(payload);
        packet
    }

    pub fn set_redundancy_level(&mut self, redundancy_percentage: f64) {
        self.config.redundancy_percentage =
            redundancy_percentage.clamp(MIN_REDUNDANCY_PERCENTAGE, MAX_REDUNDANCY_PERCENTAGE);
        self.stats.current_redundancy_percentage = self.config.redundancy_percentage;
        debug!(
            "fec encoder redundancy set to {}%",
            self.config.redundancy_percentage
        );
    }

    /// Applies a monitor recommendation, unless adaptive redundancy is off.
    pub fn apply_recommended_redundancy(&mut self, recommended: f64) {
        if self.config.adaptive_redundancy {
            self.set_redundancy_level(recommended);
        }
    }

    pub fn update_config(&mut self, config: FecConfig) {
        self.config = config.clamped();
        self.stats.current_redundancy_percentage = self.config.redundancy_percentage;
    }

    pub fn config(&self) -> &FecConfig {
        &self.config
    }

    pub fn stats(&self) -> FecEncodeStats {
        self.stats.clone()
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.stats = FecEncodeStats {
            current_redundancy_percentage: self.config.redundancy_percentage,
            ..Default::default()
        };
    }
}
