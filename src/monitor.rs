//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Network quality monitor.
//!
//! Aggregates sent/received/RTT samples into a coarse quality class and
//! tuning recommendations for the adaptive jitter buffer and the FEC engine.

use log::*;
use parking_lot::Mutex;

use crate::{
    common::{DataRate, DataSize, Duration, Instant, RingBuffer},
    packet::SequenceId,
};

/// Only events this recent count toward the windows.
const WINDOW_DURATION: Duration = Duration::from_secs(10);

const EXCELLENT_LOSS_THRESHOLD: f64 = 1.0;
const GOOD_LOSS_THRESHOLD: f64 = 3.0;
const FAIR_LOSS_THRESHOLD: f64 = 10.0;

const EXCELLENT_RTT_THRESHOLD: Duration = Duration::from_millis(5);
const GOOD_RTT_THRESHOLD: Duration = Duration::from_millis(20);
const FAIR_RTT_THRESHOLD: Duration = Duration::from_millis(50);

const EXCELLENT_JITTER_THRESHOLD: Duration = Duration::from_millis(1);
const GOOD_JITTER_THRESHOLD: Duration = Duration::from_millis(5);
const FAIR_JITTER_THRESHOLD: Duration = Duration::from_millis(20);

const MIN_SAMPLES_FOR_RELIABLE_METRICS: u64 = 10;

/// Coarse link quality, worst axis wins. Ordered from best to worst.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone)]
pub struct NetworkMetrics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Percentage, 0.0 - 100.0.
    pub packet_loss_rate: f64,

    pub min_rtt: Duration,
    pub max_rtt: Duration,
    pub avg_rtt: Duration,
    /// Standard deviation of the RTT window.
    pub jitter: Duration,

    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub throughput: DataRate,

    pub quality: NetworkQuality,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            packet_loss_rate: 0.0,
            min_rtt: Duration::ZERO,
            max_rtt: Duration::ZERO,
            avg_rtt: Duration::ZERO,
            jitter: Duration::ZERO,
            bytes_sent: 0,
            bytes_received: 0,
            throughput: DataRate::ZERO,
            quality: NetworkQuality::Excellent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PacketRecord {
    #[allow(dead_code)]
    sequence_id: SequenceId,
    size: DataSize,
    time: Instant,
}

struct MonitorState {
    sent_window: RingBuffer<PacketRecord>,
    received_window: RingBuffer<PacketRecord>,
    rtt_window: RingBuffer<Duration>,

    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,

    last_refresh: Instant,
}

/// Derives link metrics from three event streams. All recorders take the
/// event time explicitly so callers on any thread share one timeline.
pub struct NetworkMonitor {
    update_interval: Duration,
    state: Mutex<MonitorState>,
}

impl NetworkMonitor {
    pub fn new(window_size: usize, update_interval: Duration) -> Self {
        Self {
            update_interval,
            state: Mutex::new(MonitorState {
                sent_window: RingBuffer::new(window_size),
                received_window: RingBuffer::new(window_size),
                rtt_window: RingBuffer::new(window_size),
                packets_sent: 0,
                packets_received: 0,
                bytes_sent: 0,
                bytes_received: 0,
                last_refresh: Instant::now(),
            }),
        }
    }

    pub fn record_packet_sent(&self, sequence_id: SequenceId, size_bytes: usize, time: Instant) {
        let mut state = self.state.lock();
        state.sent_window.push(PacketRecord {
            sequence_id,
            size: DataSize::from_bytes(size_bytes as u64),
            time,
        });
        state.packets_sent += 1;
        state.bytes_sent += size_bytes as u64;
        Self::prune(&mut state, time);
        self.refresh_if_due(&mut state, time);
    }

    pub fn record_packet_received(
        &self,
        sequence_id: SequenceId,
        size_bytes: usize,
        time: Instant,
    ) {
        let mut state = self.state.lock();
        state.received_window.push(PacketRecord {
            sequence_id,
            size: DataSize::from_bytes(size_bytes as u64),
            time,
        });
        state.packets_received += 1;
        state.bytes_received += size_bytes as u64;
        Self::prune(&mut state, time);
        self.refresh_if_due(&mut state, time);
    }

    pub fn record_rtt(&self, rtt: Duration) {
        let mut state = self.state.lock();
        state.rtt_window.push(rtt);
    }

    pub fn metrics(&self) -> NetworkMetrics {
        let state = self.state.lock();
        Self::compute(&state)
    }

    pub fn quality(&self) -> NetworkQuality {
        self.metrics().quality
    }

    pub fn is_suitable_for_audio(&self) -> bool {
        self.quality() <= NetworkQuality::Good
    }

    /// Recommended reorder-buffer capacity for the current conditions.
    pub fn recommended_jitter_capacity(&self, min: usize, max: usize) -> usize {
        let metrics = self.metrics();
        let mut capacity = match metrics.quality {
            NetworkQuality::Excellent => min,
            NetworkQuality::Good => min + 1,
            NetworkQuality::Fair => min + 3,
            NetworkQuality::Poor => max,
        };
        if metrics.jitter > FAIR_JITTER_THRESHOLD {
            capacity += 2;
        } else if metrics.jitter > GOOD_JITTER_THRESHOLD {
            capacity += 1;
        }
        capacity.clamp(min, max)
    }

    /// Recommended FEC redundancy percentage for the current conditions.
    pub fn recommended_fec_redundancy(&self) -> f64 {
        let metrics = self.metrics();
        let mut redundancy: f64 = match metrics.quality {
            NetworkQuality::Excellent => 5.0,
            NetworkQuality::Good => 10.0,
            NetworkQuality::Fair => 20.0,
            NetworkQuality::Poor => 30.0,
        };
        if metrics.packet_loss_rate > 15.0 {
            redundancy += 10.0;
        } else if metrics.packet_loss_rate > 5.0 {
            redundancy += 5.0;
        }
        redundancy.clamp(0.0, 50.0)
    }

    /// True once enough packets have been observed for the metrics to mean anything.
    pub fn has_sufficient_data(&self) -> bool {
        self.state.lock().packets_sent >= MIN_SAMPLES_FOR_RELIABLE_METRICS
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.sent_window.clear();
        state.received_window.clear();
        state.rtt_window.clear();
        state.packets_sent = 0;
        state.packets_received = 0;
        state.bytes_sent = 0;
        state.bytes_received = 0;
        state.last_refresh = Instant::now();
    }

    /// The count cap is enforced on push; this drops records past the
    /// window duration.
    fn prune(state: &mut MonitorState, now: Instant) {
        for window in [&mut state.sent_window, &mut state.received_window] {
            window.prune_front(|record| {
                now.saturating_duration_since(record.time) > WINDOW_DURATION
            });
        }
    }

    fn refresh_if_due(&self, state: &mut MonitorState, now: Instant) {
        if now.saturating_duration_since(state.last_refresh) < self.update_interval {
            return;
        }
        state.last_refresh = now;
        let metrics = Self::compute(state);
        debug!(
            "network: loss {:.1}% rtt {:?} jitter {:?} throughput {} quality {:?}",
            metrics.packet_loss_rate,
            metrics.avg_rtt,
            metrics.jitter,
            metrics.throughput,
            metrics.quality,
        );
    }

    fn compute(state: &MonitorState) -> NetworkMetrics {
        let mut metrics = NetworkMetrics {
            packets_sent: state.packets_sent,
            packets_received: state.packets_received,
            bytes_sent: state.bytes_sent,
            bytes_received: state.bytes_received,
            ..Default::default()
        };

        if state.packets_sent > 0 {
            metrics.packets_lost = state.packets_sent.saturating_sub(state.packets_received);
            metrics.packet_loss_rate =
                metrics.packets_lost as f64 / state.packets_sent as f64 * 100.0;
        }

        let rtt_count = state.rtt_window.len() as u32;
        if rtt_count > 0 {
            metrics.min_rtt = *state.rtt_window.iter().min().unwrap();
            metrics.max_rtt = *state.rtt_window.iter().max().unwrap();
            metrics.avg_rtt = state.rtt_window.iter().sum::<Duration>() / rtt_count;
        }
        if rtt_count > 1 {
            let mean_us = metrics.avg_rtt.as_micros() as f64;
            let variance = state
                .rtt_window
                .iter()
                .map(|rtt| {
                    let diff = rtt.as_micros() as f64 - mean_us;
                    diff * diff
                })
                .sum::<f64>()
                / rtt_count as f64;
            metrics.jitter = Duration::from_micros(variance.sqrt() as u64);
        }

        if let (Some(oldest), Some(newest)) =
            (state.sent_window.iter().next(), state.sent_window.latest())
        {
            let span = newest.time.saturating_duration_since(oldest.time);
            if !span.is_zero() {
                let bytes_in_window: DataSize =
                    state.sent_window.iter().map(|record| record.size).sum();
                metrics.throughput = bytes_in_window / span;
            }
        }

        metrics.quality = Self::classify(&metrics);
        metrics
    }

    fn classify(metrics: &NetworkMetrics) -> NetworkQuality {
        let loss_class = if metrics.packet_loss_rate > FAIR_LOSS_THRESHOLD {
            NetworkQuality::Poor
        } else if metrics.packet_loss_rate > GOOD_LOSS_THRESHOLD {
            NetworkQuality::Fair
        } else if metrics.packet_loss_rate > EXCELLENT_LOSS_THRESHOLD {
            NetworkQuality::Good
        } else {
            NetworkQuality::Excellent
        };

        let rtt_class = if metrics.avg_rtt > FAIR_RTT_THRESHOLD {
            NetworkQuality::Poor
        } else if metrics.avg_rtt > GOOD_RTT_THRESHOLD {
            NetworkQuality::Fair
        } else if metrics.avg_rtt > EXCELLENT_RTT_THRESHOLD {
            NetworkQuality::Good
        } else {
            NetworkQuality::Excellent
        };

        let jitter_class = if metrics.jitter > FAIR_JITTER_THRESHOLD {
            NetworkQuality::Poor
        } else if metrics.jitter > GOOD_JITTER_THRESHOLD {
            NetworkQuality::Fair
        } else if metrics.jitter > EXCELLENT_JITTER_THRESHOLD {
            NetworkQuality::Good
        } else {
            NetworkQuality::Excellent
        };

        loss_class.max(rtt_class).max(jitter_class)
    }
}
