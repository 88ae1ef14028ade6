//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use audio_receiver::{
    common::{Duration, Instant},
    config::Config,
    decode, monitor::NetworkMonitor, pipeline::AudioPipeline, receiver::UdpReceiver, sink,
};
use env_logger::Env;
use structopt::StructOpt;

lazy_static! {
    // Load the config and treat it as a read-only static value.
    static ref CONFIG: Config = Config::from_args();
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[rustfmt::skip]
fn print_config(config: &'static Config) {
    info!("config:");
    info!("  {:32}{}", "port:", config.port);
    info!("  {:32}{}", "sample_rate:", config.sample_rate);
    info!("  {:32}{}", "channels:", config.channels);
    info!("  {:32}{}", "buffer_size:", config.buffer_size);
    info!("  {:32}{:?}", "device:", config.device);
    info!("  {:32}{}", "mock_backends:", config.mock_backends);
    info!("  {:32}{} [{} - {}]", "jitter_capacity:", config.jitter_capacity, config.jitter_min_capacity, config.jitter_max_capacity);
    info!("  {:32}{}", "adaptation_rate:", config.adaptation_rate);
    info!("  {:32}{} ms", "adaptation_interval:", config.adaptation_interval_ms);
    info!("  {:32}{} %", "fec_redundancy:", config.fec_redundancy);
    info!("  {:32}{}", "fec_max_recovery_distance:", config.fec_max_recovery_distance);
    info!("  {:32}{}", "fec_window_size:", config.fec_window_size);
    info!("  {:32}{}", "adaptive_fec:", !config.no_adaptive_fec);
    info!("  {:32}{}", "monitor_window_size:", config.monitor_window_size);
    info!("  {:32}{} ms", "monitor_update_interval:", config.monitor_update_interval_ms);
    info!("  {:32}{} s", "stats_interval:", config.stats_interval_secs);
    info!("  {:32}{:?}", "duration_secs:", config.duration_secs);
}

#[cfg(unix)]
fn install_signal_handlers() {
    extern "C" fn handle_signal(_signum: libc::c_int) {
        SHUTDOWN.store(true, Ordering::Release);
    }
    let handler: extern "C" fn(libc::c_int) = handle_signal;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn print_stats(receiver: &UdpReceiver, pipeline: &AudioPipeline, monitor: &NetworkMonitor) {
    let receiver_stats = receiver.stats();
    let pipeline_stats = pipeline.stats();
    let fec_stats = pipeline.fec_stats();
    let latency = pipeline.latency();
    let metrics = monitor.metrics();

    info!(
        "ingress: {} packets, {} dropped, {} bytes",
        receiver_stats.packets_received, receiver_stats.packets_dropped, receiver_stats.bytes_received,
    );
    info!(
        "pipeline: {} processed, {} frames decoded, {} frames out, {} decode errors, {} underruns",
        pipeline_stats.packets_processed,
        pipeline_stats.frames_decoded,
        pipeline_stats.frames_output,
        pipeline_stats.decode_errors,
        pipeline_stats.output_underruns,
    );
    info!(
        "fec: {} primary, {} redundant, {} recovered, {} unrecoverable",
        fec_stats.primary_packets_received,
        fec_stats.redundant_packets_received,
        fec_stats.packets_recovered,
        fec_stats.packets_lost_unrecoverable,
    );
    if let Some(adaptive) = pipeline.adaptive_stats() {
        info!(
            "jitter buffer: capacity {} (target {}), {} adaptations, utilization {:.0}%",
            adaptive.current_capacity,
            adaptive.target_capacity,
            adaptive.adaptations_count,
            adaptive.average_buffer_utilization * 100.0,
        );
    }
    info!(
        "latency: {:.1} ms total (decode {:.1} + output {:.1} + buffer {:.1}), deadline {}",
        latency.total_ms,
        latency.decode_ms,
        latency.output_ms,
        latency.jitter_buffer_ms,
        if pipeline.is_meeting_realtime_deadline() { "met" } else { "MISSED" },
    );
    if monitor.has_sufficient_data() {
        info!(
            "network: loss {:.1}%, rtt {:?}, jitter {:?}, throughput {}, quality {:?}, recommended fec {:.0}%",
            metrics.packet_loss_rate,
            metrics.avg_rtt,
            metrics.jitter,
            metrics.throughput,
            metrics.quality,
            monitor.recommended_fec_redundancy(),
        );
    }
}

fn main() -> Result<()> {
    // Initialize logging.
    env_logger::Builder::from_env(
        Env::default()
            .default_filter_or("audio_receiver=info")
            .default_write_style_or("never"),
    )
    .format_timestamp_millis()
    .init();

    info!("Audio Receiver starting up...");
    info!(
        "audio_receiver: v{}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );

    let config = &CONFIG;
    print_config(config);
    install_signal_handlers();

    let monitor = Arc::new(NetworkMonitor::new(
        config.monitor_window_size,
        config.monitor_update_interval(),
    ));

    let decoder = decode::create_decoder(config.sample_rate, config.channels, config.mock_backends)
        .map_err(|e| anyhow!("failed to create decoder: {}", e))?;
    let sink = sink::create_sink(
        config.sample_rate,
        config.channels,
        config.buffer_size,
        config.device.clone(),
        config.mock_backends,
    )
    .map_err(|e| anyhow!("failed to create sink: {}", e))?;

    let pipeline = Arc::new(AudioPipeline::new(
        config.pipeline_config(),
        config.adaptive_jitter_config(),
        config.fec_max_recovery_distance,
        monitor.clone(),
        decoder,
        sink,
    ));
    if !pipeline.is_initialized() {
        return Err(anyhow!("invalid pipeline configuration"));
    }
    if !pipeline.start() {
        return Err(anyhow!("failed to start the audio pipeline"));
    }

    let mut receiver = UdpReceiver::new(config.port)?;
    {
        let pipeline = pipeline.clone();
        let monitor = monitor.clone();
        // The sender does not share its send log, so treat every sequence id
        // up to the highest seen as sent; the monitor derives loss from the
        // ids that never arrive.
        let mut highest_seen: Option<u32> = None;
        receiver.start(move |packet| {
            let now = Instant::now();
            let size = packet.total_size();

            let advance = match highest_seen {
                None => 1,
                Some(highest) => {
                    audio_receiver::packet::sequence_distance(packet.sequence_id, highest)
                }
            };
            if advance > 0 {
                // Cap the inferred gap so a sender restart doesn't read as
                // a million losses.
                let inferred_count = (advance as u32).min(100);
                for back in (0..inferred_count).rev() {
                    monitor.record_packet_sent(packet.sequence_id.wrapping_sub(back), size, now);
                }
                highest_seen = Some(packet.sequence_id);
            }
            monitor.record_packet_received(packet.sequence_id, size, now);

            if let Err(e) =
                pipeline.process_audio_packet(packet.sequence_id, packet.timestamp, packet.payload)
            {
                debug!("packet {} not processed: {}", packet.sequence_id, e);
            }
        })?;
    }

    info!("listening on UDP port {}", config.port);

    let started = Instant::now();
    let stats_interval = Duration::from_secs(config.stats_interval_secs);
    let mut last_stats = started;
    while !SHUTDOWN.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(200));

        if let Some(duration_secs) = config.duration_secs {
            if started.elapsed() >= Duration::from_secs(duration_secs) {
                info!("configured duration elapsed");
                break;
            }
        }
        if last_stats.elapsed() >= stats_interval {
            print_stats(&receiver, &pipeline, &monitor);
            last_stats = Instant::now();
        }
    }

    info!("shutting down");
    receiver.stop();
    pipeline.stop();
    print_stats(&receiver, &pipeline, &monitor);
    info!("audio receiver stopped");

    Ok(())
}
