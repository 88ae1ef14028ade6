//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Compressed-audio decode capability.
//!
//! The pipeline is polymorphic over this trait. The mock variant is always
//! available and is what tests and codec-less builds run against; the Opus
//! variant is compiled in with the `opus-codec` feature and selected by
//! configuration.

use log::*;
use thiserror::Error;

pub const SUPPORTED_SAMPLE_RATE: u32 = 48_000;
/// 2.5 ms per compressed frame: 120 samples per channel at 48 kHz.
pub const FRAME_DURATION_US: u64 = 2_500;
pub const MAX_PACKET_SIZE: usize = 1500;

/// Samples per channel in one frame.
pub fn frame_size(sample_rate: u32) -> usize {
    (sample_rate as u64 * FRAME_DURATION_US / 1_000_000) as usize
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum DecodeError {
    #[error("unsupported decoder configuration: {0}")]
    UnsupportedConfig(&'static str),
    #[error("frame of {0} bytes is not decodable")]
    BadFrame(usize),
    #[error("decoder failure: {0}")]
    Failed(String),
}

pub trait AudioDecoder: Send {
    /// Decodes one compressed frame into interleaved f32 PCM of exactly
    /// `frame_size() * channels()` samples.
    fn decode(&mut self, encoded: &[u8]) -> Result<Vec<f32>, DecodeError>;

    /// Packet-loss concealment: produces a substitute frame when the
    /// compressed data for a sequence id is permanently missing.
    fn decode_plc(&mut self) -> Result<Vec<f32>, DecodeError>;

    fn reset(&mut self);

    fn sample_rate(&self) -> u32;
    fn channels(&self) -> usize;
    fn frame_size(&self) -> usize;

    fn frames_decoded(&self) -> u64;
    fn decode_errors(&self) -> u64;
}

/// Deterministic stand-in for the real codec. Rejects frames the way a real
/// decoder would (too short, oversized, or carrying the poison marker) and
/// produces silence for everything else.
pub struct MockDecoder {
    sample_rate: u32,
    channels: usize,
    frame_size: usize,
    frames_decoded: u64,
    decode_errors: u64,
}

impl MockDecoder {
    /// Frames shorter than this don't look like compressed audio.
    pub const MIN_FRAME_BYTES: usize = 8;
    /// A payload starting with this marker decodes as invalid, so tests can
    /// provoke decode errors deliberately.
    pub const POISON: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

    pub fn new(sample_rate: u32, channels: usize) -> Result<Self, DecodeError> {
        if sample_rate != SUPPORTED_SAMPLE_RATE {
            return Err(DecodeError::UnsupportedConfig("sample rate"));
        }
        if !(1..=2).contains(&channels) {
            return Err(DecodeError::UnsupportedConfig("channel count"));
        }
        Ok(Self {
            sample_rate,
            channels,
            frame_size: frame_size(sample_rate),
            frames_decoded: 0,
            decode_errors: 0,
        })
    }
}

impl AudioDecoder for MockDecoder {
    fn decode(&mut self, encoded: &[u8]) -> Result<Vec<f32>, DecodeError> {
        if encoded.len() < Self::MIN_FRAME_BYTES
            || encoded.len() > MAX_PACKET_SIZE
            || encoded.starts_with(&Self::POISON)
        {
            self.decode_errors += 1;
            return Err(DecodeError::BadFrame(encoded.len()));
        }
        self.frames_decoded += 1;
        Ok(vec![0.0; self.frame_size * self.channels])
    }

    fn decode_plc(&mut self) -> Result<Vec<f32>, DecodeError> {
        Ok(vec![0.0; self.frame_size * self.channels])
    }

    fn reset(&mut self) {
        self.frames_decoded = 0;
        self.decode_errors = 0;
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    fn decode_errors(&self) -> u64 {
        self.decode_errors
    }
}

#[cfg(feature = "opus-codec")]
pub use real::OpusAudioDecoder;

#[cfg(feature = "opus-codec")]
mod real {
    use super::*;

    /// Opus in CELT-only low-latency mode, 2.5 ms frames.
    pub struct OpusAudioDecoder {
        decoder: opus::Decoder,
        sample_rate: u32,
        channels: usize,
        frame_size: usize,
        frames_decoded: u64,
        decode_errors: u64,
    }

    impl OpusAudioDecoder {
        pub fn new(sample_rate: u32, channels: usize) -> Result<Self, DecodeError> {
            if sample_rate != SUPPORTED_SAMPLE_RATE {
                return Err(DecodeError::UnsupportedConfig("sample rate"));
            }
            let opus_channels = match channels {
                1 => opus::Channels::Mono,
                2 => opus::Channels::Stereo,
                _ => return Err(DecodeError::UnsupportedConfig("channel count")),
            };
            let decoder = opus::Decoder::new(sample_rate, opus_channels)
                .map_err(|e| DecodeError::Failed(e.to_string()))?;
            Ok(Self {
                decoder,
                sample_rate,
                channels,
                frame_size: frame_size(sample_rate),
                frames_decoded: 0,
                decode_errors: 0,
            })
        }
    }

    impl AudioDecoder for OpusAudioDecoder {
        fn decode(&mut self, encoded: &[u8]) -> Result<Vec<f32>, DecodeError> {
            if encoded.is_empty() || encoded.len() > MAX_PACKET_SIZE {
                self.decode_errors += 1;
                return Err(DecodeError::BadFrame(encoded.len()));
            }
            let mut pcm = vec![0.0f32; self.frame_size * self.channels];
            match self.decoder.decode_float(encoded, &mut pcm, false) {
                Ok(samples) => {
                    pcm.truncate(samples * self.channels);
                    pcm.resize(self.frame_size * self.channels, 0.0);
                    self.frames_decoded += 1;
                    Ok(pcm)
                }
                Err(e) => {
                    self.decode_errors += 1;
                    Err(DecodeError::Failed(e.to_string()))
                }
            }
        }

        fn decode_plc(&mut self) -> Result<Vec<f32>, DecodeError> {
            let mut pcm = vec![0.0f32; self.frame_size * self.channels];
            match self.decoder.decode_float(&[], &mut pcm, true) {
                Ok(samples) => {
                    pcm.truncate(samples * self.channels);
                    pcm.resize(self.frame_size * self.channels, 0.0);
                    Ok(pcm)
                }
                Err(e) => Err(DecodeError::Failed(e.to_string())),
            }
        }

        fn reset(&mut self) {
            if let Err(e) = self.decoder.reset_state() {
                warn!("failed to reset opus decoder: {}", e);
            }
            self.frames_decoded = 0;
            self.decode_errors = 0;
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> usize {
            self.channels
        }

        fn frame_size(&self) -> usize {
            self.frame_size
        }

        fn frames_decoded(&self) -> u64 {
            self.frames_decoded
        }

        fn decode_errors(&self) -> u64 {
            self.decode_errors
        }
    }
}

/// Builds the decoder selected by configuration.
pub fn create_decoder(
    sample_rate: u32,
    channels: usize,
    use_mock: bool,
) -> Result<Box<dyn AudioDecoder>, DecodeError> {
    if use_mock {
        info!("using mock audio decoder");
        return Ok(Box::new(MockDecoder::new(sample_rate, channels)?));
    }
    #[cfg(feature = "opus-codec")]
    {
        info!("using opus audio decoder");
        Ok(Box::new(OpusAudioDecoder::new(sample_rate, channels)?))
    }
    #[cfg(not(feature = "opus-codec"))]
    {
        warn!("opus codec not compiled in, falling back to mock decoder");
        Ok(Box::new(MockDecoder::new(sample_rate, channels)?))
    }
}
