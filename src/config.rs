//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Configuration options for the audio receiver.

use structopt::StructOpt;

use crate::{
    common::Duration,
    fec::FecConfig,
    jitter::adaptive::AdaptiveJitterConfig,
    pipeline::PipelineConfig,
};

/// General configuration options, set by command line arguments or
/// falls back to default or environment variables (in some cases).
#[derive(Default, StructOpt, Debug, Clone)]
#[structopt(name = "audio_receiver")]
pub struct Config {
    /// The UDP port to listen on for audio datagrams.
    #[structopt(long, default_value = "12345", env = "AUDIO_RECEIVER_PORT")]
    pub port: u16,

    /// Output sample rate. Only 48000 Hz is supported.
    #[structopt(long, default_value = "48000")]
    pub sample_rate: u32,

    /// Output channel count (1 = mono, 2 = stereo).
    #[structopt(long, default_value = "2")]
    pub channels: usize,

    /// Samples per channel in one sink write (64-512). Smaller is lower
    /// latency, larger is more resilient.
    #[structopt(long, default_value = "128")]
    pub buffer_size: usize,

    /// Name of the output device to use; the default device if unset.
    #[structopt(long)]
    pub device: Option<String>,

    /// Use the mock decoder and sink instead of the real backends.
    #[structopt(long)]
    pub mock_backends: bool,

    /// Initial jitter buffer capacity in packets.
    #[structopt(long, default_value = "5")]
    pub jitter_capacity: usize,

    /// Minimum jitter buffer capacity the adaptive controller may choose.
    #[structopt(long, default_value = "3")]
    pub jitter_min_capacity: usize,

    /// Maximum jitter buffer capacity the adaptive controller may choose.
    #[structopt(long, default_value = "10")]
    pub jitter_max_capacity: usize,

    /// How quickly the jitter buffer adapts toward its target (0.0-1.0).
    #[structopt(long, default_value = "0.1")]
    pub adaptation_rate: f64,

    /// Jitter buffer adaptation interval (ms).
    #[structopt(long, default_value = "500")]
    pub adaptation_interval_ms: u64,

    /// Packet loss (%) above which the buffer grows an extra packet.
    #[structopt(long, default_value = "5.0")]
    pub packet_loss_threshold: f64,

    /// Jitter (µs) above which the buffer grows an extra packet.
    #[structopt(long, default_value = "10000")]
    pub jitter_threshold_us: u64,

    /// RTT (µs) above which the buffer grows an extra packet.
    #[structopt(long, default_value = "50000")]
    pub rtt_threshold_us: u64,

    /// Capacity samples considered by the stability check.
    #[structopt(long, default_value = "10")]
    pub stability_window: usize,

    /// Maximum coefficient of variation considered stable.
    #[structopt(long, default_value = "0.2")]
    pub stability_threshold: f64,

    /// FEC redundancy percentage (0-50).
    #[structopt(long, default_value = "20.0")]
    pub fec_redundancy: f64,

    /// Maximum packets between a loss and the copy that repairs it.
    #[structopt(long, default_value = "5")]
    pub fec_max_recovery_distance: usize,

    /// FEC sliding window size (at most 20).
    #[structopt(long, default_value = "10")]
    pub fec_window_size: usize,

    /// Retune FEC redundancy from observed network quality.
    #[structopt(long)]
    pub no_adaptive_fec: bool,

    /// Samples kept in the network monitor windows.
    #[structopt(long, default_value = "100")]
    pub monitor_window_size: usize,

    /// Network monitor refresh interval (ms).
    #[structopt(long, default_value = "1000")]
    pub monitor_update_interval_ms: u64,

    /// Interval used to post statistics to the log (seconds).
    #[structopt(long, default_value = "5")]
    pub stats_interval_secs: u64,

    /// Stop after this many seconds; run until interrupted if unset.
    #[structopt(long)]
    pub duration_secs: Option<u64>,
}

impl Config {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            buffer_size: self.buffer_size,
            jitter_capacity: self.jitter_capacity,
            device_name: self.device.clone(),
        }
    }

    pub fn adaptive_jitter_config(&self) -> AdaptiveJitterConfig {
        AdaptiveJitterConfig {
            min_capacity: self.jitter_min_capacity,
            max_capacity: self.jitter_max_capacity,
            default_capacity: self.jitter_capacity,
            adaptation_rate: self.adaptation_rate,
            update_interval: Duration::from_millis(self.adaptation_interval_ms),
            packet_loss_threshold: self.packet_loss_threshold,
            jitter_threshold: Duration::from_micros(self.jitter_threshold_us),
            rtt_threshold: Duration::from_micros(self.rtt_threshold_us),
            stability_window: self.stability_window,
            stability_threshold: self.stability_threshold,
        }
    }

    pub fn fec_config(&self) -> FecConfig {
        FecConfig {
            redundancy_percentage: self.fec_redundancy,
            max_recovery_distance: self.fec_max_recovery_distance,
            window_size: self.fec_window_size,
            adaptive_redundancy: !self.no_adaptive_fec,
        }
    }

    pub fn monitor_update_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_update_interval_ms)
    }
}

#[cfg(test)]
pub(crate) fn default_test_config() -> Config {
    Config {
        port: 0,
        sample_rate: 48000,
        channels: 2,
        buffer_size: 128,
        device: None,
        mock_backends: true,
        jitter_capacity: 5,
        jitter_min_capacity: 3,
        jitter_max_capacity: 10,
        adaptation_rate: 0.1,
        adaptation_interval_ms: 500,
        packet_loss_threshold: 5.0,
        jitter_threshold_us: 10_000,
        rtt_threshold_us: 50_000,
        stability_window: 10,
        stability_threshold: 0.2,
        fec_redundancy: 20.0,
        fec_max_recovery_distance: 5,
        fec_window_size: 10,
        no_adaptive_fec: false,
        monitor_window_size: 100,
        monitor_update_interval_ms: 1000,
        stats_interval_secs: 5,
        duration_secs: None,
    }
}
