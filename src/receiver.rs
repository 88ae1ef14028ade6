//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! UDP ingress: a dedicated thread blocks on the receive socket, parses
//! audio datagrams, and hands them to a callback. Malformed datagrams are
//! counted and dropped; the stream continues.

use std::{
    net::UdpSocket,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use anyhow::Result;
use log::*;

use crate::{packet::AudioPacket, qos};

/// How often the receive loop re-checks the shutdown flag while idle.
const RECV_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);
/// Largest datagram we accept off the wire.
const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_received: u64,
}

struct SharedStats {
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_received: AtomicU64,
}

pub struct UdpReceiver {
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    receive_thread: Option<JoinHandle<()>>,
}

impl UdpReceiver {
    /// Binds the receive socket and applies real-time QoS marking.
    pub fn new(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        if !qos::set_audio_qos(&socket) {
            debug!("continuing without QoS marking");
        }
        info!("udp receiver bound to {}", socket.local_addr()?);
        Ok(Self {
            socket,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SharedStats {
                packets_received: AtomicU64::new(0),
                packets_dropped: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
            receive_thread: None,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Starts the receive loop. Each successfully parsed datagram is passed
    /// to `handle_packet` on the receiver thread.
    pub fn start(
        &mut self,
        mut handle_packet: impl FnMut(AudioPacket) + Send + 'static,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let socket = self.socket.try_clone()?;
        let running = self.running.clone();
        let stats = self.stats.clone();

        self.receive_thread = Some(
            std::thread::Builder::new()
                .name("udp-receiver".to_string())
                .spawn(move || {
                    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
                    while running.load(Ordering::Acquire) {
                        let (size, sender_addr) = match socket.recv_from(&mut buf) {
                            Ok(received) => received,
                            Err(e)
                                if e.kind() == std::io::ErrorKind::WouldBlock
                                    || e.kind() == std::io::ErrorKind::TimedOut =>
                            {
                                continue;
                            }
                            Err(e) => {
                                warn!("recv_from() failed: {}", e);
                                continue;
                            }
                        };
                        trace!("received {} bytes from {}", size, sender_addr);
                        stats.bytes_received.fetch_add(size as u64, Ordering::Relaxed);

                        match AudioPacket::deserialize(&buf[..size]) {
                            Ok(packet) => {
                                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                                handle_packet(packet);
                            }
                            Err(e) => {
                                stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                                debug!(
                                    "dropping datagram from {}: {} ({})",
                                    sender_addr,
                                    e,
                                    hex::encode(&buf[..size.min(32)]),
                                );
                            }
                        }
                    }
                    debug!("udp receiver loop stopped");
                })?,
        );
        info!("udp receiver started");
        Ok(())
    }

    /// Stops the receive loop promptly (within one read timeout). Idempotent.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.receive_thread.take() {
            let _ = handle.join();
        }
        info!("udp receiver stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.stats.packets_dropped.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}
