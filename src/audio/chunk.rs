//! Immutable blocks of mono 16-bit PCM plus a few local signal generators.

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ProtocolError;

/// A contiguous block of signed 16-bit mono PCM. Cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Decode raw little-endian PCM bytes.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> Result<Self, ProtocolError> {
        if bytes.len() % 2 != 0 {
            return Err(ProtocolError::OddPcmLength(bytes.len()));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        Ok(Self::new(samples, sample_rate))
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in self.samples.iter() {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration at the chunk's own sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Re-chunk into pieces no longer than `max`. Smaller pieces bound the
    /// worst-case interrupt latency at the cost of more per-chunk overhead.
    pub fn split(&self, max: Duration) -> Vec<AudioChunk> {
        let per_piece = ((max.as_secs_f64() * self.sample_rate as f64) as usize).max(1);
        if self.samples.len() <= per_piece {
            return vec![self.clone()];
        }
        self.samples
            .chunks(per_piece)
            .map(|piece| AudioChunk::new(piece.to_vec(), self.sample_rate))
            .collect()
    }

    /// Sine tone, with a short linear fade at both ends to avoid clicks.
    pub fn tone(frequency_hz: f32, duration: Duration, sample_rate: u32, amplitude: f32) -> Self {
        let total = (duration.as_secs_f64() * sample_rate as f64) as usize;
        let fade = (sample_rate as usize / 200).min(total / 2).max(1);
        let peak = amplitude.clamp(0.0, 1.0) * i16::MAX as f32;
        let samples = (0..total)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                let edge = i.min(total - 1 - i);
                let gain = if edge < fade { edge as f32 / fade as f32 } else { 1.0 };
                ((2.0 * PI * frequency_hz * t).sin() * peak * gain) as i16
            })
            .collect();
        Self::new(samples, sample_rate)
    }

    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        let total = (duration.as_secs_f64() * sample_rate as f64) as usize;
        Self::new(vec![0; total], sample_rate)
    }
}

/// Linear resampler used when the device negotiated a different rate than
/// the producer sent.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 {
        return input.to_vec();
    }
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let a = input[idx.min(input.len() - 1)] as f64;
            let b = input[(idx + 1).min(input.len() - 1)] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Duplicate mono samples across `channels` interleaved channels.
pub fn upmix(mono: &[i16], channels: u32) -> Vec<i16> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_bytes_decode() {
        let chunk = AudioChunk::from_le_bytes(&[0x01, 0x00, 0xff, 0xff], 16000).unwrap();
        assert_eq!(chunk.samples(), &[1, -1]);
        assert_eq!(chunk.to_le_bytes(), vec![0x01, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_odd_byte_count_rejected() {
        let err = AudioChunk::from_le_bytes(&[0, 1, 2], 16000).unwrap_err();
        assert!(matches!(err, ProtocolError::OddPcmLength(3)));
    }

    #[test]
    fn test_split_bounds_piece_duration() {
        let chunk = AudioChunk::silence(Duration::from_millis(100), 24000);
        let pieces = chunk.split(Duration::from_millis(40));
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.duration() <= Duration::from_millis(40)));
        let total: usize = pieces.iter().map(AudioChunk::len).sum();
        assert_eq!(total, chunk.len());
    }

    #[test]
    fn test_tone_length_and_fade() {
        let tone = AudioChunk::tone(440.0, Duration::from_millis(50), 16000, 0.5);
        assert_eq!(tone.len(), 800);
        assert_eq!(tone.samples()[0], 0);
        assert!(tone.samples().iter().any(|s| s.abs() > 1000));
    }

    #[test]
    fn test_resample_and_upmix() {
        let input = vec![0i16, 100, 200, 300];
        assert_eq!(resample_linear(&input, 8000, 16000).len(), 8);
        assert_eq!(resample_linear(&input, 16000, 16000), input);
        assert_eq!(upmix(&[1, 2], 2), vec![1, 1, 2, 2]);
    }
}
