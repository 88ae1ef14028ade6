//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The receiver pipeline: ingress -> FEC recovery -> reorder -> decode -> sink.
//!
//! A single worker thread is the sole mutator of the reorder buffer, the
//! FEC decoder state, and the latency snapshot. Ingress callers only
//! enqueue on the guarded ingress queue and wake the worker; consumers of
//! statistics read atomics or take short locks.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use log::*;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{
    common::{Duration, Instant},
    decode::AudioDecoder,
    fec::{in_recovery_window, FecDecoder},
    jitter::{
        adaptive::{AdaptiveJitterBuffer, AdaptiveJitterConfig, AdaptiveStats},
        JitterError, JitterStats, MAX_CAPACITY, MIN_CAPACITY,
    },
    monitor::NetworkMonitor,
    packet::{sequence_distance, SequenceId},
    sink::{AudioSink, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE},
};

pub const SUPPORTED_SAMPLE_RATE: u32 = 48_000;
/// The end-to-end budget from packet arrival to audio output.
pub const TARGET_TOTAL_LATENCY_MS: f64 = 10.0;

/// Worker wait when a tick makes no progress.
const IDLE_WAIT: Duration = Duration::MILLISECOND;
/// Static decode cost until the codec reports one.
const DECODE_LATENCY_PLACEHOLDER_MS: f64 = 1.5;
/// Nominal playout time of one buffered packet.
const PACKET_DURATION_MS: f64 = 2.5;
const PACKET_DURATION_US: u64 = 2_500;
/// Bounded ingress queue; the oldest packet is dropped on overflow.
const MAX_INGRESS_QUEUE: usize = 256;
/// Frames pulled from the reorder buffer stay in the decoded queue only
/// briefly; holding depth in the reorder buffer is what masks reordering.
const DECODED_QUEUE_TARGET: usize = 2;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum PipelineError {
    #[error("pipeline is not running")]
    NotRunning,
    #[error("malformed audio packet")]
    Malformed,
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PipelineState {
    Uninitialised,
    Initialised,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sample_rate: u32,
    pub channels: usize,
    /// Samples per channel handed to the sink in one write.
    pub buffer_size: usize,
    /// Initial reorder-buffer capacity in packets.
    pub jitter_capacity: usize,
    pub device_name: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SUPPORTED_SAMPLE_RATE,
            channels: 2,
            buffer_size: 128,
            jitter_capacity: 5,
            device_name: None,
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.sample_rate != SUPPORTED_SAMPLE_RATE {
            return Err(PipelineError::InvalidConfig("sample rate"));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(PipelineError::InvalidConfig("channel count"));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(PipelineError::InvalidConfig("buffer size"));
        }
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.jitter_capacity) {
            return Err(PipelineError::InvalidConfig("jitter capacity"));
        }
        Ok(())
    }
}

/// Component latencies in milliseconds, worker-updated every tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyBreakdown {
    pub decode_ms: f64,
    pub output_ms: f64,
    pub jitter_buffer_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub packets_processed: u64,
    pub frames_decoded: u64,
    pub frames_output: u64,
    pub decode_errors: u64,
    pub output_underruns: u64,
    pub ingress_dropped: u64,
    pub avg_processing_time_us: f64,
    pub cpu_usage_percent: f64,
}

struct IngressPacket {
    sequence_id: SequenceId,
    timestamp: u64,
    data: Vec<u8>,
}

struct Shared {
    running: std::sync::atomic::AtomicBool,
    ingress: Mutex<VecDeque<IngressPacket>>,
    work_ready: Condvar,
    decoded: Mutex<VecDeque<Vec<f32>>>,
    jitter: AdaptiveJitterBuffer,
    fec: FecDecoder,
    latency: Mutex<LatencyBreakdown>,

    packets_processed: AtomicU64,
    frames_decoded: AtomicU64,
    frames_output: AtomicU64,
    decode_errors: AtomicU64,
    output_underruns: AtomicU64,
    ingress_dropped: AtomicU64,
    total_processing_us: AtomicU64,
    ticks: AtomicU64,
}

/// Sequence tracking private to the worker thread.
#[derive(Default)]
struct WorkerState {
    highest_seen: Option<SequenceId>,
    /// Missing sids awaiting a redundant copy, with an approximate
    /// sender timestamp reconstructed from their neighbours.
    pending_losses: BTreeMap<SequenceId, u64>,
}

pub struct AudioPipeline {
    config: PipelineConfig,
    monitor: Arc<NetworkMonitor>,
    state: Mutex<PipelineState>,
    shared: Option<Arc<Shared>>,
    components: Mutex<Option<(Box<dyn AudioDecoder>, Box<dyn AudioSink>)>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPipeline {
    /// Builds the pipeline around an injected decoder and sink.
    ///
    /// Invalid parameters leave the pipeline in the `Uninitialised` state,
    /// in which every operation is rejected.
    pub fn new(
        config: PipelineConfig,
        adaptive_config: AdaptiveJitterConfig,
        max_recovery_distance: usize,
        monitor: Arc<NetworkMonitor>,
        decoder: Box<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        if let Err(e) = config.validate() {
            warn!("audio pipeline not initialised: {}", e);
            return Self {
                config,
                monitor,
                state: Mutex::new(PipelineState::Uninitialised),
                shared: None,
                components: Mutex::new(None),
                worker: Mutex::new(None),
            };
        }

        let frame_size = decoder.frame_size();
        let jitter = match AdaptiveJitterBuffer::new(
            frame_size,
            config.channels,
            AdaptiveJitterConfig {
                default_capacity: config.jitter_capacity,
                ..adaptive_config
            },
            monitor.clone(),
        ) {
            Ok(jitter) => jitter,
            Err(e) => {
                warn!("audio pipeline not initialised: {}", e);
                return Self {
                    config,
                    monitor,
                    state: Mutex::new(PipelineState::Uninitialised),
                    shared: None,
                    components: Mutex::new(None),
                    worker: Mutex::new(None),
                };
            }
        };

        info!(
            "audio pipeline initialised: {} Hz, {} channels, {} sample buffer, {} packet jitter buffer",
            config.sample_rate, config.channels, config.buffer_size, config.jitter_capacity,
        );

        Self {
            config,
            monitor,
            state: Mutex::new(PipelineState::Initialised),
            shared: Some(Arc::new(Shared {
                running: std::sync::atomic::AtomicBool::new(false),
                ingress: Mutex::new(VecDeque::new()),
                work_ready: Condvar::new(),
                decoded: Mutex::new(VecDeque::new()),
                jitter,
                fec: FecDecoder::new(max_recovery_distance),
                latency: Mutex::new(LatencyBreakdown::default()),
                packets_processed: AtomicU64::new(0),
                frames_decoded: AtomicU64::new(0),
                frames_output: AtomicU64::new(0),
                decode_errors: AtomicU64::new(0),
                output_underruns: AtomicU64::new(0),
                ingress_dropped: AtomicU64::new(0),
                total_processing_us: AtomicU64::new(0),
                ticks: AtomicU64::new(0),
            })),
            components: Mutex::new(Some((decoder, sink))),
            worker: Mutex::new(None),
        }
    }

    /// Starts the sink and the worker thread. Returns false (leaving the
    /// state unchanged) when the sink cannot start.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if *state != PipelineState::Initialised {
            return false;
        }
        let shared = match &self.shared {
            Some(shared) => shared.clone(),
            None => return false,
        };

        let (decoder, mut sink) = match self.components.lock().take() {
            Some(components) => components,
            None => return false,
        };
        if !sink.start() {
            error!("failed to start audio sink");
            *self.components.lock() = Some((decoder, sink));
            return false;
        }

        shared.running.store(true, Ordering::Release);
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name("audio-pipeline".to_string())
            .spawn(move || Self::worker_loop(shared, config, decoder, sink));
        match handle {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                *state = PipelineState::Running;
                info!("audio pipeline started");
                true
            }
            Err(e) => {
                error!("failed to spawn pipeline worker: {}", e);
                if let Some(shared) = &self.shared {
                    shared.running.store(false, Ordering::Release);
                }
                false
            }
        }
    }

    /// Requests shutdown, joins the worker, and flushes the queues.
    /// Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state != PipelineState::Running {
            return;
        }
        let shared = match &self.shared {
            Some(shared) => shared.clone(),
            None => return,
        };

        info!("stopping audio pipeline");
        shared.running.store(false, Ordering::Release);
        shared.work_ready.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("pipeline worker panicked");
            }
        }

        shared.ingress.lock().clear();
        shared.decoded.lock().clear();
        *state = PipelineState::Stopped;
        info!("audio pipeline stopped");
    }

    /// Enqueues one received packet for the worker. Non-blocking.
    pub fn process_audio_packet(
        &self,
        sequence_id: SequenceId,
        timestamp: u64,
        data: Vec<u8>,
    ) -> Result<(), PipelineError> {
        let shared = self.shared.as_ref().ok_or(PipelineError::NotRunning)?;
        if !shared.running.load(Ordering::Acquire) {
            return Err(PipelineError::NotRunning);
        }
        if data.is_empty() {
            shared.decode_errors.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::Malformed);
        }

        {
            let mut ingress = shared.ingress.lock();
            if ingress.len() >= MAX_INGRESS_QUEUE {
                ingress.pop_front();
                shared.ingress_dropped.fetch_add(1, Ordering::Relaxed);
            }
            ingress.push_back(IngressPacket {
                sequence_id,
                timestamp,
                data,
            });
        }
        shared.work_ready.notify_one();
        shared.packets_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn worker_loop(
        shared: Arc<Shared>,
        config: PipelineConfig,
        mut decoder: Box<dyn AudioDecoder>,
        mut sink: Box<dyn AudioSink>,
    ) {
        debug!("pipeline worker started");
        let mut worker_state = WorkerState::default();

        while shared.running.load(Ordering::Acquire) {
            let tick_start = Instant::now();
            let mut progressed = false;

            progressed |= Self::drain_ingress(&shared, &mut worker_state, decoder.as_mut());
            progressed |= Self::recover_pending(&shared, &mut worker_state, decoder.as_mut());
            progressed |= Self::drain_reorder(&shared);
            progressed |= Self::drain_decoded(&shared, &config, sink.as_mut());

            Self::update_latency(&shared, sink.as_ref());

            let tick_us = tick_start.elapsed().as_micros() as u64;
            shared.total_processing_us.fetch_add(tick_us, Ordering::Relaxed);
            shared.ticks.fetch_add(1, Ordering::Relaxed);

            if !progressed {
                let mut ingress = shared.ingress.lock();
                if ingress.is_empty() && shared.running.load(Ordering::Acquire) {
                    let _ = shared.work_ready.wait_for(&mut ingress, IDLE_WAIT.into());
                }
            }
        }

        sink.stop();
        debug!("pipeline worker stopped");
    }

    /// Step 1: feed everything queued by ingress callers through the FEC
    /// decoder and admit recovered primaries into the reorder buffer.
    fn drain_ingress(
        shared: &Shared,
        worker_state: &mut WorkerState,
        decoder: &mut dyn AudioDecoder,
    ) -> bool {
        let batch: Vec<IngressPacket> = {
            let mut ingress = shared.ingress.lock();
            ingress.drain(..).collect()
        };
        if batch.is_empty() {
            return false;
        }

        let now = Instant::now();
        let max_distance = shared.fec.max_recovery_distance();
        for packet in &batch {
            match shared.fec.process_packet(&packet.data, now) {
                Ok(Some(primary)) => {
                    Self::note_sequence_gaps(
                        worker_state,
                        primary.sequence_id,
                        packet.timestamp,
                        max_distance,
                    );
                    Self::decode_and_admit(
                        shared,
                        decoder,
                        primary.sequence_id,
                        packet.timestamp,
                        &primary.data,
                    );
                }
                Ok(None) => {
                    // Redundant copy stored; a pending loss may now be repairable.
                }
                Err(e) => {
                    shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "dropping malformed packet seq={}: {} ({})",
                        packet.sequence_id,
                        e,
                        hex::encode(&packet.data[..packet.data.len().min(16)]),
                    );
                }
            }
        }
        true
    }

    /// Records the sids skipped over by an arriving primary so redundancy
    /// can repair them once a copy shows up. Only sids within the recovery
    /// distance are worth tracking; anything further back is already lost.
    fn note_sequence_gaps(
        worker_state: &mut WorkerState,
        sequence_id: SequenceId,
        timestamp: u64,
        max_distance: usize,
    ) {
        worker_state.pending_losses.remove(&sequence_id);

        let highest = match worker_state.highest_seen {
            None => {
                worker_state.highest_seen = Some(sequence_id);
                return;
            }
            Some(highest) => highest,
        };
        let gap = sequence_distance(sequence_id, highest.wrapping_add(1));
        if gap > 0 {
            for back in 1..=(gap as u32).min(max_distance as u32) {
                let missing = sequence_id.wrapping_sub(back);
                let approx_ts = timestamp.saturating_sub(back as u64 * PACKET_DURATION_US);
                worker_state.pending_losses.entry(missing).or_insert(approx_ts);
            }
        }
        if sequence_distance(sequence_id, highest) > 0 {
            worker_state.highest_seen = Some(sequence_id);
        }
    }

    /// Attempts FEC recovery for pending losses. A loss leaves the pending
    /// set either recovered or, once outside the recovery window,
    /// permanently lost (the stream proceeds with the gap).
    fn recover_pending(
        shared: &Shared,
        worker_state: &mut WorkerState,
        decoder: &mut dyn AudioDecoder,
    ) -> bool {
        if worker_state.pending_losses.is_empty() {
            return false;
        }
        let highest = match worker_state.highest_seen {
            Some(highest) => highest,
            None => return false,
        };
        let max_distance = shared.fec.max_recovery_distance();

        let pending: Vec<(SequenceId, u64)> = worker_state
            .pending_losses
            .iter()
            .map(|(sid, ts)| (*sid, *ts))
            .collect();
        let mut progressed = false;
        for (missing, approx_ts) in pending {
            if shared.fec.can_recover(missing) {
                if let Ok(recovered) = shared.fec.recover(missing) {
                    trace!("recovered lost sequence {} via redundancy", missing);
                    Self::decode_and_admit(shared, decoder, missing, approx_ts, &recovered.data);
                    progressed = true;
                }
                worker_state.pending_losses.remove(&missing);
            } else if !in_recovery_window(missing, highest, max_distance) {
                // One final attempt so the loss is counted as unrecoverable.
                if shared.fec.recover(missing).is_err() {
                    debug!("sequence {} permanently lost", missing);
                }
                worker_state.pending_losses.remove(&missing);
            }
        }
        progressed
    }

    fn decode_and_admit(
        shared: &Shared,
        decoder: &mut dyn AudioDecoder,
        sequence_id: SequenceId,
        timestamp: u64,
        data: &[u8],
    ) {
        let pcm = match decoder.decode(data) {
            Ok(pcm) => pcm,
            Err(e) => {
                shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("decode failed for seq={}: {}", sequence_id, e);
                return;
            }
        };
        match shared.jitter.add(sequence_id, timestamp, pcm) {
            Ok(()) => {
                shared.frames_decoded.fetch_add(1, Ordering::Relaxed);
            }
            Err(JitterError::Duplicate(_)) | Err(JitterError::Late(_)) => {
                // Counted by the buffer itself.
            }
            Err(e) => {
                shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("reorder buffer rejected seq={}: {}", sequence_id, e);
            }
        }
    }

    /// Step 2: release frames from the reorder buffer toward the sink,
    /// keeping only a small handoff backlog so depth stays in the reorder
    /// buffer where it masks reordering.
    fn drain_reorder(shared: &Shared) -> bool {
        let mut progressed = false;
        loop {
            if shared.decoded.lock().len() >= DECODED_QUEUE_TARGET {
                break;
            }
            if shared.jitter.is_empty() {
                break;
            }
            match shared.jitter.pop() {
                Some(entry) => {
                    shared.decoded.lock().push_back(entry.pcm);
                    progressed = true;
                }
                None => break,
            }
        }
        progressed
    }

    /// Step 3: pad or truncate each frame to the sink's block size and
    /// write it out. No lock is held across the (possibly blocking) write.
    fn drain_decoded(shared: &Shared, config: &PipelineConfig, sink: &mut dyn AudioSink) -> bool {
        let block = config.buffer_size * config.channels;
        let mut progressed = false;
        while shared.running.load(Ordering::Acquire) {
            let frame = shared.decoded.lock().pop_front();
            let mut frame = match frame {
                Some(frame) => frame,
                None => break,
            };
            frame.resize(block, 0.0);
            if sink.write(&frame) {
                shared.frames_output.fetch_add(1, Ordering::Relaxed);
            } else {
                shared.output_underruns.fetch_add(1, Ordering::Relaxed);
            }
            progressed = true;
        }
        progressed
    }

    fn update_latency(shared: &Shared, sink: &dyn AudioSink) {
        let jitter_ms = shared.jitter.len() as f64 * PACKET_DURATION_MS;
        let output_ms = sink.estimated_latency_ms();
        let mut latency = shared.latency.lock();
        latency.decode_ms = DECODE_LATENCY_PLACEHOLDER_MS;
        latency.output_ms = output_ms;
        latency.jitter_buffer_ms = jitter_ms;
        latency.total_ms = latency.decode_ms + latency.output_ms + latency.jitter_buffer_ms;
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() != PipelineState::Uninitialised
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .as_ref()
            .map(|shared| shared.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn latency(&self) -> LatencyBreakdown {
        self.shared
            .as_ref()
            .map(|shared| *shared.latency.lock())
            .unwrap_or_default()
    }

    pub fn is_meeting_realtime_deadline(&self) -> bool {
        self.latency().total_ms <= TARGET_TOTAL_LATENCY_MS
    }

    pub fn stats(&self) -> PipelineStats {
        let shared = match &self.shared {
            Some(shared) => shared,
            None => return PipelineStats::default(),
        };
        let ticks = shared.ticks.load(Ordering::Relaxed);
        let total_us = shared.total_processing_us.load(Ordering::Relaxed);
        let avg_processing_time_us = if ticks > 0 {
            total_us as f64 / ticks as f64
        } else {
            0.0
        };
        PipelineStats {
            packets_processed: shared.packets_processed.load(Ordering::Relaxed),
            frames_decoded: shared.frames_decoded.load(Ordering::Relaxed),
            frames_output: shared.frames_output.load(Ordering::Relaxed),
            decode_errors: shared.decode_errors.load(Ordering::Relaxed),
            output_underruns: shared.output_underruns.load(Ordering::Relaxed),
            ingress_dropped: shared.ingress_dropped.load(Ordering::Relaxed),
            avg_processing_time_us,
            // Share of the 1 ms tick budget spent processing.
            cpu_usage_percent: (avg_processing_time_us / 10.0).min(100.0),
        }
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.shared
            .as_ref()
            .map(|shared| shared.jitter.jitter_stats())
            .unwrap_or_default()
    }

    pub fn adaptive_stats(&self) -> Option<AdaptiveStats> {
        self.shared.as_ref().map(|shared| shared.jitter.stats())
    }

    pub fn fec_stats(&self) -> crate::fec::FecDecodeStats {
        self.shared
            .as_ref()
            .map(|shared| shared.fec.stats())
            .unwrap_or_default()
    }

    pub fn set_jitter_capacity(&self, capacity: usize) -> Result<(), JitterError> {
        match &self.shared {
            Some(shared) => shared.jitter.set_capacity(capacity),
            None => Err(JitterError::InvalidCapacity(capacity)),
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
