//! 16-bit PCM codec for the realtime wire format.
//!
//! - Encoder: f32 samples in [-1, 1] → clamp → i16 little-endian bytes
//! - Decoder: i16 little-endian bytes → f32 [`AudioBuffer`]

use std::time::Duration;

use base64::Engine;

use crate::error::CodecError;

/// Capture rate sent to the remote model.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate of the synthetic speech returned by the remote model.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Mime type attached to every outbound chunk.
pub const CAPTURE_MIME: &str = "audio/pcm;rate=16000";

// ======================== AudioBuffer ========================

/// Decoded, playable audio. Samples are interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ======================== Encoder ========================

/// Encode f32 samples to 16-bit little-endian PCM.
///
/// Out-of-range input is clamped; sample count and order are preserved.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&float_to_i16(s).to_le_bytes());
    }
    out
}

pub(crate) fn float_to_i16(sample: f32) -> i16 {
    // NaN is treated as silence
    let s = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Encode and wrap as base64, the form the realtime input message carries.
pub fn encode_base64(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode(samples))
}

// ======================== Decoder ========================

/// Decode a 16-bit little-endian PCM frame into a playable buffer.
pub fn decode(frame: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer, CodecError> {
    if sample_rate == 0 || channels == 0 {
        return Err(CodecError::InvalidFormat {
            sample_rate,
            channels,
        });
    }
    if frame.len() % 2 != 0 {
        return Err(CodecError::OddLength(frame.len()));
    }

    let sample_count = frame.len() / 2;
    if sample_count % channels as usize != 0 {
        return Err(CodecError::PartialFrame {
            samples: sample_count,
            channels,
        });
    }

    let samples = frame
        .chunks_exact(2)
        .map(|b| i16_to_float(i16::from_le_bytes([b[0], b[1]])))
        .collect();

    Ok(AudioBuffer::new(samples, sample_rate, channels))
}

fn i16_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Decode a base64 inline-data payload. The rate comes from the mime type
/// (`audio/pcm;rate=24000`), defaulting to [`PLAYBACK_SAMPLE_RATE`] mono.
pub fn decode_base64(payload: &str, mime_type: Option<&str>) -> Result<AudioBuffer, CodecError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    let rate = mime_type
        .and_then(parse_mime_rate)
        .unwrap_or(PLAYBACK_SAMPLE_RATE);
    decode(&bytes, rate, 1)
}

/// Extract `rate=N` from a PCM mime type.
pub fn parse_mime_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("rate="))
        .and_then(|v| v.trim().parse().ok())
        .filter(|&rate| rate > 0)
}
