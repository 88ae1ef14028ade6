//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! PCM output capability.
//!
//! A sink accepts blocks of `buffer_size * channels` interleaved f32
//! samples and plays them with bounded latency. The mock variant is always
//! available; the cpal-backed variant is compiled in with the
//! `cpal-output` feature and selected by configuration.

use log::*;
use thiserror::Error;

pub const SUPPORTED_SAMPLE_RATE: u32 = 48_000;
pub const MIN_BUFFER_SIZE: usize = 64;
pub const MAX_BUFFER_SIZE: usize = 512;

/// Device-side latency the mock pretends to have on top of one buffer period.
const MOCK_DEVICE_LATENCY_MS: f64 = 2.0;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum SinkError {
    #[error("unsupported sink configuration: {0}")]
    UnsupportedConfig(&'static str),
}

pub trait AudioSink: Send {
    /// Starts playback. Returns false when the device cannot be opened.
    fn start(&mut self) -> bool;

    fn stop(&mut self);

    /// Writes one block of `buffer_size * channels` samples. May block for
    /// up to one buffer period. Returns false on failure, which the caller
    /// counts as an underrun and moves on from.
    fn write(&mut self, pcm: &[f32]) -> bool;

    fn estimated_latency_ms(&self) -> f64;
    fn frames_written(&self) -> u64;
    fn underruns(&self) -> u64;
}

pub(crate) fn validate_sink_config(
    sample_rate: u32,
    channels: usize,
    buffer_size: usize,
) -> Result<(), SinkError> {
    if sample_rate != SUPPORTED_SAMPLE_RATE {
        return Err(SinkError::UnsupportedConfig("sample rate"));
    }
    if !(1..=2).contains(&channels) {
        return Err(SinkError::UnsupportedConfig("channel count"));
    }
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&buffer_size) {
        return Err(SinkError::UnsupportedConfig("buffer size"));
    }
    Ok(())
}

/// Headless sink for tests and codec-less builds: accepts writes while
/// running and reports a fixed latency estimate.
pub struct MockSink {
    sample_rate: u32,
    channels: usize,
    buffer_size: usize,
    running: bool,
    frames_written: u64,
    underruns: u64,
}

impl MockSink {
    pub fn new(sample_rate: u32, channels: usize, buffer_size: usize) -> Result<Self, SinkError> {
        validate_sink_config(sample_rate, channels, buffer_size)?;
        Ok(Self {
            sample_rate,
            channels,
            buffer_size,
            running: false,
            frames_written: 0,
            underruns: 0,
        })
    }

    fn buffer_period_ms(&self) -> f64 {
        self.buffer_size as f64 / self.sample_rate as f64 * 1000.0
    }
}

impl AudioSink for MockSink {
    fn start(&mut self) -> bool {
        self.running = true;
        true
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn write(&mut self, pcm: &[f32]) -> bool {
        if !self.running || pcm.len() != self.buffer_size * self.channels {
            self.underruns += 1;
            return false;
        }
        self.frames_written += self.buffer_size as u64;
        true
    }

    fn estimated_latency_ms(&self) -> f64 {
        self.buffer_period_ms() + MOCK_DEVICE_LATENCY_MS
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn underruns(&self) -> u64 {
        self.underruns
    }
}

#[cfg(feature = "cpal-output")]
pub use real::CpalSink;

#[cfg(feature = "cpal-output")]
mod real {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread::JoinHandle,
    };

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use parking_lot::{Condvar, Mutex};

    use super::*;

    /// Keep at most this many buffer periods queued ahead of the device.
    const MAX_QUEUED_PERIODS: usize = 8;

    struct SharedBuffer {
        samples: Mutex<VecDeque<f32>>,
        space: Condvar,
    }

    /// Real output through the default (or named) cpal device.
    ///
    /// The cpal stream is not `Send`, so it lives on a dedicated playback
    /// thread; `write` feeds the shared sample queue the stream callback
    /// drains.
    pub struct CpalSink {
        sample_rate: u32,
        channels: usize,
        buffer_size: usize,
        device_name: Option<String>,

        shared: Arc<SharedBuffer>,
        running: Arc<AtomicBool>,
        started_ok: Arc<AtomicBool>,
        callback_underruns: Arc<AtomicU64>,
        frames_written: u64,
        write_failures: u64,
        playback_thread: Option<JoinHandle<()>>,
    }

    impl CpalSink {
        pub fn new(
            sample_rate: u32,
            channels: usize,
            buffer_size: usize,
            device_name: Option<String>,
        ) -> Result<Self, SinkError> {
            validate_sink_config(sample_rate, channels, buffer_size)?;
            Ok(Self {
                sample_rate,
                channels,
                buffer_size,
                device_name,
                shared: Arc::new(SharedBuffer {
                    samples: Mutex::new(VecDeque::new()),
                    space: Condvar::new(),
                }),
                running: Arc::new(AtomicBool::new(false)),
                started_ok: Arc::new(AtomicBool::new(false)),
                callback_underruns: Arc::new(AtomicU64::new(0)),
                frames_written: 0,
                write_failures: 0,
                playback_thread: None,
            })
        }

        fn max_queued_samples(&self) -> usize {
            self.buffer_size * self.channels * MAX_QUEUED_PERIODS
        }
    }

    impl AudioSink for CpalSink {
        fn start(&mut self) -> bool {
            if self.running.load(Ordering::Acquire) {
                return true;
            }
            self.running.store(true, Ordering::Release);

            let shared = self.shared.clone();
            let running = self.running.clone();
            let started_ok = self.started_ok.clone();
            let callback_underruns = self.callback_underruns.clone();
            let device_name = self.device_name.clone();
            let stream_config = cpal::StreamConfig {
                channels: self.channels as u16,
                sample_rate: cpal::SampleRate(self.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(self.buffer_size as u32),
            };

            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<bool>();
            let handle = std::thread::Builder::new()
                .name("audio-output".to_string())
                .spawn(move || {
                    let host = cpal::default_host();
                    let device = match &device_name {
                        Some(name) => host.output_devices().ok().and_then(|mut devices| {
                            devices.find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                        }),
                        None => host.default_output_device(),
                    };
                    let device = match device {
                        Some(device) => device,
                        None => {
                            error!("no audio output device found");
                            let _ = ready_tx.send(false);
                            return;
                        }
                    };

                    let shared_for_callback = shared.clone();
                    let stream = device.build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let mut samples = shared_for_callback.samples.lock();
                            let available = samples.len().min(data.len());
                            for sample in data[..available].iter_mut() {
                                *sample = samples.pop_front().unwrap_or(0.0);
                            }
                            if available < data.len() {
                                data[available..].fill(0.0);
                                callback_underruns.fetch_add(1, Ordering::Relaxed);
                            }
                            drop(samples);
                            shared_for_callback.space.notify_one();
                        },
                        |err| error!("audio output stream error: {}", err),
                        None,
                    );
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("failed to build output stream: {}", e);
                            let _ = ready_tx.send(false);
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        error!("failed to start output stream: {}", e);
                        let _ = ready_tx.send(false);
                        return;
                    }
                    let _ = ready_tx.send(true);

                    // Keep the stream alive until stop().
                    while running.load(Ordering::Acquire) {
                        std::thread::park_timeout(std::time::Duration::from_millis(100));
                    }
                });

            let handle = match handle {
                Ok(handle) => handle,
                Err(e) => {
                    error!("failed to spawn playback thread: {}", e);
                    self.running.store(false, Ordering::Release);
                    return false;
                }
            };

            let ok = ready_rx.recv().unwrap_or(false);
            if ok {
                self.playback_thread = Some(handle);
                self.started_ok.store(true, Ordering::Release);
                info!(
                    "audio output started: {} Hz, {} channels, {} sample buffer",
                    self.sample_rate, self.channels, self.buffer_size
                );
            } else {
                self.running.store(false, Ordering::Release);
                let _ = handle.join();
            }
            ok
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::Release);
            self.started_ok.store(false, Ordering::Release);
            if let Some(handle) = self.playback_thread.take() {
                handle.thread().unpark();
                let _ = handle.join();
            }
            self.shared.samples.lock().clear();
        }

        fn write(&mut self, pcm: &[f32]) -> bool {
            if !self.started_ok.load(Ordering::Acquire)
                || pcm.len() != self.buffer_size * self.channels
            {
                self.write_failures += 1;
                return false;
            }

            let mut samples = self.shared.samples.lock();
            // Apply backpressure for at most one buffer period; the device
            // callback frees space as it plays.
            if samples.len() + pcm.len() > self.max_queued_samples() {
                let period =
                    std::time::Duration::from_micros(
                        self.buffer_size as u64 * 1_000_000 / self.sample_rate as u64,
                    );
                let _ = self.shared.space.wait_for(&mut samples, period);
            }
            if samples.len() + pcm.len() > self.max_queued_samples() {
                self.write_failures += 1;
                return false;
            }
            samples.extend(pcm.iter().copied());
            drop(samples);

            self.frames_written += self.buffer_size as u64;
            true
        }

        fn estimated_latency_ms(&self) -> f64 {
            let queued = self.shared.samples.lock().len();
            let queued_ms = queued as f64 / (self.sample_rate as f64 * self.channels as f64) * 1000.0;
            let period_ms = self.buffer_size as f64 / self.sample_rate as f64 * 1000.0;
            queued_ms + period_ms
        }

        fn frames_written(&self) -> u64 {
            self.frames_written
        }

        fn underruns(&self) -> u64 {
            self.write_failures + self.callback_underruns.load(Ordering::Relaxed)
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

/// Builds the sink selected by configuration.
pub fn create_sink(
    sample_rate: u32,
    channels: usize,
    buffer_size: usize,
    device_name: Option<String>,
    use_mock: bool,
) -> Result<Box<dyn AudioSink>, SinkError> {
    if use_mock {
        info!("using mock audio sink");
        return Ok(Box::new(MockSink::new(sample_rate, channels, buffer_size)?));
    }
    #[cfg(feature = "cpal-output")]
    {
        info!("using cpal audio sink");
        Ok(Box::new(CpalSink::new(
            sample_rate,
            channels,
            buffer_size,
            device_name,
        )?))
    }
    #[cfg(not(feature = "cpal-output"))]
    {
        let _ = device_name;
        warn!("cpal output not compiled in, falling back to mock sink");
        Ok(Box::new(MockSink::new(sample_rate, channels, buffer_size)?))
    }
}
