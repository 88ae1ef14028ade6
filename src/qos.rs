//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! DSCP marking for the receive socket, per RFC 4594. Real-time audio
//! traffic is marked CS5 so cooperating networks can prioritise it.

use std::net::UdpSocket;

use log::*;

/// DiffServ service classes this crate cares about.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum DscpClass {
    Default = 0,
    /// Real-time data.
    Cs4 = 32,
    /// Real-time audio/video.
    Cs5 = 40,
    /// Expedited forwarding.
    Ef = 46,
}

impl DscpClass {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Sets the DSCP marking on a UDP socket. Returns false when the platform
/// or the socket refuses the option; callers treat that as advisory.
#[cfg(unix)]
pub fn set_socket_dscp(socket: &UdpSocket, class: DscpClass) -> bool {
    use std::os::unix::io::AsRawFd;

    // The DSCP field is the upper six bits of the IP TOS byte.
    let tos = (class.value() as libc::c_int) << 2;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &tos as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!(
            "failed to set DSCP {:?} on socket: {}",
            class,
            std::io::Error::last_os_error()
        );
        return false;
    }
    debug!("socket marked with DSCP {:?} (tos 0x{:02x})", class, tos);
    true
}

#[cfg(not(unix))]
pub fn set_socket_dscp(_socket: &UdpSocket, class: DscpClass) -> bool {
    warn!("DSCP marking ({:?}) is not supported on this platform", class);
    false
}

/// Convenience marking for real-time audio streams.
pub fn set_audio_qos(socket: &UdpSocket) -> bool {
    set_socket_dscp(socket, DscpClass::Cs5)
}

pub fn is_qos_supported() -> bool {
    cfg!(unix)
}
