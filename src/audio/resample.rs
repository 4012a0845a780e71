//! Channel mixing and linear-interpolation rate conversion.
//!
//! Speech energy sits well below 8 kHz, so linear interpolation is enough for
//! the 16 kHz uplink and the 24 kHz downlink.

/// Streaming resampler that carries its fractional read position and the last
/// input sample across calls, so consecutive capture periods join without clicks.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    in_rate: u32,
    out_rate: u32,
    pos: f64,
    carry: Option<f32>,
}

impl LinearResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Self {
        Self {
            in_rate,
            out_rate,
            pos: 0.0,
            carry: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.in_rate == self.out_rate
    }

    /// Resample one block of mono samples, appending to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_passthrough() || self.in_rate == 0 || self.out_rate == 0 {
            out.extend_from_slice(input);
            return;
        }
        if input.is_empty() {
            return;
        }

        let step = self.in_rate as f64 / self.out_rate as f64;
        let offset = usize::from(self.carry.is_some());
        let len = input.len() + offset;
        let at = |i: usize| -> f32 {
            match (i, self.carry) {
                (0, Some(c)) => c,
                _ => input[i - offset],
            }
        };

        while self.pos + 1.0 < len as f64 {
            let idx = self.pos as usize;
            let frac = (self.pos - idx as f64) as f32;
            out.push(at(idx) * (1.0 - frac) + at(idx + 1) * frac);
            self.pos += step;
        }

        self.pos -= (len - 1) as f64;
        self.carry = input.last().copied();
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.carry = None;
    }
}

/// One-shot resample of a whole mono buffer.
pub fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Duplicate mono samples across `channels` interleaved channels.
pub fn from_mono(mono: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return mono.to_vec();
    }
    let mut out = Vec::with_capacity(mono.len() * channels as usize);
    for &s in mono {
        for _ in 0..channels {
            out.push(s);
        }
    }
    out
}
