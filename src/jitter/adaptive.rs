//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Adaptive capacity controller around the reorder buffer.
//!
//! On a throttled tick the controller pulls the monitor's recommended
//! capacity, nudges it for observed loss/jitter/RTT, and steps the buffer
//! toward the target. Resizes migrate every stored entry in sequence order
//! under the buffer lock, so callers always observe a consistent buffer.

use std::sync::Arc;

use log::*;
use parking_lot::Mutex;

use crate::{
    common::{Duration, Instant, RingBuffer},
    jitter::{JitterBuffer, JitterEntry, JitterError, JitterStats},
    monitor::{NetworkMonitor, NetworkQuality},
    packet::SequenceId,
};

/// Adaptation never runs more often than this, no matter the configured interval.
const MIN_ADAPTATION_INTERVAL: Duration = Duration::from_millis(100);

const MIN_ADAPTATION_FACTOR: f64 = 0.5;
const MAX_ADAPTATION_FACTOR: f64 = 2.0;
const MAX_CAPACITY_HISTORY: usize = 20;

#[derive(Debug, Clone)]
pub struct AdaptiveJitterConfig {
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub default_capacity: usize,

    /// How quickly capacity moves toward the target, 0.0 - 1.0.
    pub adaptation_rate: f64,
    pub update_interval: Duration,

    /// Observed-condition nudges: each exceeded threshold adds one packet
    /// to the target capacity.
    pub packet_loss_threshold: f64,
    pub jitter_threshold: Duration,
    pub rtt_threshold: Duration,

    pub stability_window: usize,
    pub stability_threshold: f64,
}

impl Default for AdaptiveJitterConfig {
    fn default() -> Self {
        Self {
            min_capacity: 3,
            max_capacity: 10,
            default_capacity: 5,
            adaptation_rate: 0.1,
            update_interval: Duration::from_millis(500),
            packet_loss_threshold: 5.0,
            jitter_threshold: Duration::from_millis(10),
            rtt_threshold: Duration::from_millis(50),
            stability_window: 10,
            stability_threshold: 0.2,
        }
    }
}

impl AdaptiveJitterConfig {
    fn validated(mut self) -> Self {
        self.min_capacity = self.min_capacity.max(crate::jitter::MIN_CAPACITY);
        self.max_capacity = self
            .max_capacity
            .clamp(self.min_capacity, crate::jitter::MAX_CAPACITY);
        self.default_capacity = self
            .default_capacity
            .clamp(self.min_capacity, self.max_capacity);
        self.adaptation_rate = self.adaptation_rate.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveStats {
    pub current_capacity: usize,
    pub target_capacity: usize,
    pub adaptation_factor: f64,

    pub current_network_quality: NetworkQuality,
    pub current_packet_loss_rate: f64,
    pub current_rtt: Duration,
    pub current_jitter: Duration,

    pub adaptations_count: u64,
    pub capacity_increases: u64,
    pub capacity_decreases: u64,

    pub average_buffer_utilization: f64,
    pub underruns: u64,
    pub overruns: u64,
}

struct AdaptiveState {
    config: AdaptiveJitterConfig,
    stats: AdaptiveStats,
    capacity_history: RingBuffer<usize>,
    utilization_history: RingBuffer<f64>,
    last_adaptation: Instant,
    last_update: Instant,
}

/// The reorder buffer behind a capacity controller fed by the network
/// monitor. The monitor is shared, not owned; retuning is pull-based.
pub struct AdaptiveJitterBuffer {
    frame_size: usize,
    channels: usize,
    monitor: Arc<NetworkMonitor>,
    buffer: Mutex<JitterBuffer>,
    adaptive: Mutex<AdaptiveState>,
}

impl AdaptiveJitterBuffer {
    pub fn new(
        frame_size: usize,
        channels: usize,
        config: AdaptiveJitterConfig,
        monitor: Arc<NetworkMonitor>,
    ) -> Result<Self, JitterError> {
        let config = config.validated();
        let buffer = JitterBuffer::new(config.default_capacity, frame_size, channels)?;
        let now = Instant::now();
        let stats = AdaptiveStats {
            current_capacity: config.default_capacity,
            target_capacity: config.default_capacity,
            adaptation_factor: 1.0,
            current_network_quality: NetworkQuality::Excellent,
            current_packet_loss_rate: 0.0,
            current_rtt: Duration::ZERO,
            current_jitter: Duration::ZERO,
            adaptations_count: 0,
            capacity_increases: 0,
            capacity_decreases: 0,
            average_buffer_utilization: 0.0,
            underruns: 0,
            overruns: 0,
        };
        Ok(Self {
            frame_size,
            channels,
            monitor,
            buffer: Mutex::new(buffer),
            adaptive: Mutex::new(AdaptiveState {
                config,
                stats,
                capacity_history: RingBuffer::new(MAX_CAPACITY_HISTORY),
                utilization_history: RingBuffer::new(MAX_CAPACITY_HISTORY),
                last_adaptation: now,
                last_update: now,
            }),
        })
    }

    /// Admits one decoded frame, running an adaptation tick first if one is due.
    pub fn add(
        &self,
        sequence_id: SequenceId,
        timestamp: u64,
        pcm: Vec<f32>,
    ) -> Result<(), JitterError> {
        self.maybe_adapt(Instant::now());

        let (result, utilization, was_full) = {
            let mut buffer = self.buffer.lock();
            let was_full = buffer.is_full();
            let result = buffer.add(sequence_id, timestamp, pcm);
            (result, buffer.len() as f64 / buffer.capacity() as f64, was_full)
        };

        let mut state = self.adaptive.lock();
        if was_full {
            state.stats.overruns += 1;
        }
        Self::record_utilization(&mut state, utilization);
        drop(state);

        result
    }

    /// Removes the entry with the smallest stored sequence id.
    /// Popping an empty buffer counts as an underrun.
    pub fn pop(&self) -> Option<JitterEntry> {
        self.maybe_adapt(Instant::now());

        let (entry, utilization) = {
            let mut buffer = self.buffer.lock();
            let entry = buffer.pop();
            (entry, buffer.len() as f64 / buffer.capacity() as f64)
        };

        let mut state = self.adaptive.lock();
        if entry.is_none() {
            state.stats.underruns += 1;
        }
        Self::record_utilization(&mut state, utilization);
        drop(state);

        entry
    }

    /// Runs an adaptation cycle now if the update interval has elapsed.
    pub fn update_adaptation(&self, now: Instant) {
        let mut state = self.adaptive.lock();
        if now.saturating_duration_since(state.last_update) < state.config.update_interval {
            return;
        }
        self.adapt(&mut state, now);
    }

    fn maybe_adapt(&self, now: Instant) {
        let mut state = self.adaptive.lock();
        if now.saturating_duration_since(state.last_adaptation) < MIN_ADAPTATION_INTERVAL {
            return;
        }
        if now.saturating_duration_since(state.last_update) < state.config.update_interval {
            return;
        }
        self.adapt(&mut state, now);
    }

    fn adapt(&self, state: &mut AdaptiveState, now: Instant) {
        let metrics = self.monitor.metrics();
        state.stats.current_network_quality = metrics.quality;
        state.stats.current_packet_loss_rate = metrics.packet_loss_rate;
        state.stats.current_rtt = metrics.avg_rtt;
        state.stats.current_jitter = metrics.jitter;

        let mut target = self
            .monitor
            .recommended_jitter_capacity(state.config.min_capacity, state.config.max_capacity);
        if metrics.packet_loss_rate > state.config.packet_loss_threshold {
            target += 1;
        }
        if metrics.jitter > state.config.jitter_threshold {
            target += 1;
        }
        if metrics.avg_rtt > state.config.rtt_threshold {
            target += 1;
        }
        let target = target.clamp(state.config.min_capacity, state.config.max_capacity);
        state.stats.target_capacity = target;

        let factor = Self::adaptation_factor(state, metrics.quality);
        state.stats.adaptation_factor = factor;

        let current = state.stats.current_capacity;
        if target != current {
            let diff = target as i64 - current as i64;
            let mut step = (diff as f64 * state.config.adaptation_rate * factor).ceil() as i64;
            if step == 0 {
                step = diff.signum();
            }
            let new_capacity = ((current as i64 + step).max(0) as usize)
                .clamp(state.config.min_capacity, state.config.max_capacity);
            if new_capacity != current {
                self.apply_capacity_change(state, new_capacity, now);
            }
        }

        state.last_update = now;
    }

    fn adaptation_factor(state: &AdaptiveState, quality: NetworkQuality) -> f64 {
        let mut factor: f64 = match quality {
            NetworkQuality::Excellent => 1.2,
            NetworkQuality::Good => 1.0,
            NetworkQuality::Fair => 0.8,
            NetworkQuality::Poor => 0.6,
        };
        if !Self::is_stable(state) {
            factor *= 0.5;
        }
        factor.clamp(MIN_ADAPTATION_FACTOR, MAX_ADAPTATION_FACTOR)
    }

    /// Stable iff the recent capacity samples have a coefficient of
    /// variation at or below the configured threshold.
    fn is_stable(state: &AdaptiveState) -> bool {
        let window = state.config.stability_window;
        if state.capacity_history.len() < window {
            return true;
        }
        let recent: Vec<f64> = state
            .capacity_history
            .iter()
            .rev()
            .take(window)
            .map(|c| *c as f64)
            .collect();
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        if mean <= 0.0 {
            return true;
        }
        let variance =
            recent.iter().map(|c| (c - mean) * (c - mean)).sum::<f64>() / recent.len() as f64;
        variance.sqrt() / mean <= state.config.stability_threshold
    }

    fn apply_capacity_change(&self, state: &mut AdaptiveState, new_capacity: usize, now: Instant) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.migrate(new_capacity).is_err() {
                // The new capacity was validated against the configured
                // bounds, which sit inside the buffer's own limits.
                return;
            }
        }

        let old_capacity = state.stats.current_capacity;
        if new_capacity > old_capacity {
            state.stats.capacity_increases += 1;
        } else {
            state.stats.capacity_decreases += 1;
        }
        state.stats.current_capacity = new_capacity;
        state.stats.adaptations_count += 1;
        state.last_adaptation = now;
        state.capacity_history.push(new_capacity);

        debug!(
            "jitter buffer capacity {} -> {} (target {}, quality {:?})",
            old_capacity, new_capacity, state.stats.target_capacity, state.stats.current_network_quality,
        );
    }

    /// Forces the capacity to an exact value inside the configured bounds.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), JitterError> {
        let mut state = self.adaptive.lock();
        if capacity < state.config.min_capacity || capacity > state.config.max_capacity {
            return Err(JitterError::InvalidCapacity(capacity));
        }
        if capacity != state.stats.current_capacity {
            self.apply_capacity_change(&mut state, capacity, Instant::now());
        }
        Ok(())
    }

    fn record_utilization(state: &mut AdaptiveState, utilization: f64) {
        state.utilization_history.push(utilization);
        let count = state.utilization_history.len();
        if count > 0 {
            state.stats.average_buffer_utilization =
                state.utilization_history.iter().sum::<f64>() / count as f64;
        }
    }

    pub fn stats(&self) -> AdaptiveStats {
        self.adaptive.lock().stats.clone()
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.buffer.lock().stats()
    }

    pub fn config(&self) -> AdaptiveJitterConfig {
        self.adaptive.lock().config.clone()
    }

    pub fn update_config(&self, config: AdaptiveJitterConfig) {
        let mut state = self.adaptive.lock();
        state.config = config.validated();
        let current = state.stats.current_capacity;
        let clamped = current.clamp(state.config.min_capacity, state.config.max_capacity);
        if clamped != current {
            self.apply_capacity_change(&mut state, clamped, Instant::now());
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.lock().is_full()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<NetworkMonitor> {
        Arc::new(NetworkMonitor::new(100, Duration::from_secs(1)))
    }

    fn fast_config() -> AdaptiveJitterConfig {
        AdaptiveJitterConfig {
            update_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn frame() -> Vec<f32> {
        vec![0.0; 120 * 2]
    }

    fn make_poor(monitor: &NetworkMonitor) {
        let now = Instant::now();
        for sid in 1..=100 {
            monitor.record_packet_sent(sid, 100, now);
        }
        for sid in 1..=80 {
            monitor.record_packet_received(sid, 100, now);
        }
    }

    #[test]
    fn starts_at_default_capacity() {
        let buffer =
            AdaptiveJitterBuffer::new(120, 2, AdaptiveJitterConfig::default(), monitor()).unwrap();
        assert_eq!(5, buffer.capacity());
        assert_eq!(5, buffer.stats().current_capacity);
    }

    #[test]
    fn config_is_validated() {
        let config = AdaptiveJitterConfig {
            min_capacity: 0,
            max_capacity: 50,
            default_capacity: 40,
            adaptation_rate: 7.0,
            ..Default::default()
        };
        let buffer = AdaptiveJitterBuffer::new(120, 2, config, monitor()).unwrap();
        let config = buffer.config();
        assert_eq!(1, config.min_capacity);
        assert_eq!(20, config.max_capacity);
        assert_eq!(20, buffer.capacity());
        assert_eq!(1.0, config.adaptation_rate);
    }

    #[test]
    fn add_and_pop_delegate_in_order() {
        let buffer =
            AdaptiveJitterBuffer::new(120, 2, AdaptiveJitterConfig::default(), monitor()).unwrap();
        buffer.add(2, 200, frame()).unwrap();
        buffer.add(1, 100, frame()).unwrap();
        assert_eq!(1, buffer.pop().unwrap().sequence_id);
        assert_eq!(2, buffer.pop().unwrap().sequence_id);
        assert_eq!(None, buffer.pop());
        // The final pop on an empty buffer is an underrun.
        assert_eq!(1, buffer.stats().underruns);
    }

    #[test]
    fn set_capacity_validates_bounds() {
        let buffer =
            AdaptiveJitterBuffer::new(120, 2, AdaptiveJitterConfig::default(), monitor()).unwrap();
        assert_eq!(Err(JitterError::InvalidCapacity(2)), buffer.set_capacity(2));
        assert_eq!(
            Err(JitterError::InvalidCapacity(11)),
            buffer.set_capacity(11)
        );
        assert_eq!(Ok(()), buffer.set_capacity(8));
        assert_eq!(8, buffer.capacity());
        assert_eq!(1, buffer.stats().adaptations_count);
    }

    #[test]
    fn set_capacity_migrates_entries() {
        let buffer =
            AdaptiveJitterBuffer::new(120, 2, AdaptiveJitterConfig::default(), monitor()).unwrap();
        for sid in [4, 1, 3] {
            buffer.add(sid, sid as u64 * 100, frame()).unwrap();
        }
        buffer.set_capacity(9).unwrap();
        assert_eq!(3, buffer.len());
        assert_eq!(1, buffer.pop().unwrap().sequence_id);
        assert_eq!(3, buffer.pop().unwrap().sequence_id);
        assert_eq!(4, buffer.pop().unwrap().sequence_id);
    }

    #[test]
    fn adaptation_steps_toward_poor_network_target() {
        let monitor = monitor();
        make_poor(&monitor);
        let buffer = AdaptiveJitterBuffer::new(120, 2, fast_config(), monitor).unwrap();
        assert_eq!(5, buffer.capacity());

        let mut now = Instant::now();
        let mut last = buffer.capacity();
        for _ in 0..8 {
            now += Duration::from_millis(150);
            buffer.update_adaptation(now);
            let capacity = buffer.capacity();
            assert!(capacity >= last, "capacity shrank under poor network");
            last = capacity;
        }
        assert_eq!(10, buffer.capacity());
        let stats = buffer.stats();
        assert_eq!(NetworkQuality::Poor, stats.current_network_quality);
        assert_eq!(10, stats.target_capacity);
        assert!(stats.capacity_increases >= 5);
        assert_eq!(0, stats.capacity_decreases);
    }

    #[test]
    fn excellent_network_shrinks_toward_min() {
        let monitor = monitor();
        {
            let now = Instant::now();
            for sid in 1..=100 {
                monitor.record_packet_sent(sid, 100, now);
                monitor.record_packet_received(sid, 100, now);
            }
        }
        let buffer = AdaptiveJitterBuffer::new(120, 2, fast_config(), monitor).unwrap();

        let mut now = Instant::now();
        for _ in 0..8 {
            now += Duration::from_millis(150);
            buffer.update_adaptation(now);
        }
        assert_eq!(3, buffer.capacity());
        assert!(buffer.stats().capacity_decreases >= 2);
    }

    #[test]
    fn adaptation_respects_update_interval() {
        let monitor = monitor();
        make_poor(&monitor);
        let buffer = AdaptiveJitterBuffer::new(
            120,
            2,
            AdaptiveJitterConfig {
                update_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            monitor,
        )
        .unwrap();

        buffer.update_adaptation(Instant::now() + Duration::from_millis(200));
        assert_eq!(5, buffer.capacity());
        assert_eq!(0, buffer.stats().adaptations_count);
    }

    #[test]
    fn migration_preserves_entries_under_adaptation() {
        let monitor = monitor();
        make_poor(&monitor);
        let buffer = AdaptiveJitterBuffer::new(120, 2, fast_config(), monitor).unwrap();
        for sid in 1..=4 {
            buffer.add(sid, sid as u64 * 2500, frame()).unwrap();
        }

        let mut now = Instant::now();
        for _ in 0..6 {
            now += Duration::from_millis(150);
            buffer.update_adaptation(now);
        }

        let mut sids = Vec::new();
        while let Some(entry) = buffer.pop() {
            sids.push(entry.sequence_id);
        }
        assert_eq!(vec![1, 2, 3, 4], sids);
    }

    #[test]
    fn overruns_are_counted() {
        let config = AdaptiveJitterConfig {
            min_capacity: 1,
            max_capacity: 2,
            default_capacity: 2,
            // Effectively disable retuning for this test.
            update_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let buffer = AdaptiveJitterBuffer::new(120, 2, config, monitor()).unwrap();
        buffer.add(1, 100, frame()).unwrap();
        buffer.add(2, 200, frame()).unwrap();
        buffer.add(3, 300, frame()).unwrap();
        assert_eq!(1, buffer.stats().overruns);
        assert_eq!(1, buffer.jitter_stats().packets_dropped);
    }
}
