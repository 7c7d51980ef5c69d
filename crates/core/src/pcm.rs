//! Helpers for 16-bit little-endian mono PCM.

use std::time::Duration;

const BYTES_PER_SAMPLE: usize = 2;

/// Interprets little-endian byte pairs as i16 samples. A trailing odd byte is ignored.
pub fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Decodes PCM16 bytes straight to normalized f32 samples for playback.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    convert_i16_to_f32(&bytes_to_i16(bytes))
}

/// Encodes normalized f32 samples as PCM16 bytes, clamping out-of-range input.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    i16_to_bytes(&convert_f32_to_i16(samples))
}

/// Playback length of `byte_len` bytes of mono PCM16 at `sample_rate`.
pub fn duration_of(byte_len: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let samples = byte_len / BYTES_PER_SAMPLE as u64;
    Duration::from_nanos(samples * 1_000_000_000 / sample_rate as u64)
}
