//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Receiver-side real-time audio streaming core.
//!
//! Ordered-but-unreliable datagrams come in; forward-error-correction
//! recovery, adaptive jitter buffering, and decoding turn them into a
//! continuous low-latency PCM stream on the output device.

pub mod common;
pub mod config;
pub mod decode;
pub mod fec;
pub mod jitter;
pub mod monitor;
pub mod packet;
pub mod pipeline;
pub mod qos;
pub mod receiver;
pub mod sink;
