//! 16-bit little-endian PCM helpers.

use byteorder::{LittleEndian, WriteBytesExt};

/// Convert float samples in `[-1, 1]` to 16-bit little-endian PCM.
pub fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let s = s.clamp(-1.0, 1.0);
        let v = if s < 0.0 { s * 32_768.0 } else { s * 32_767.0 };
        // Writing into a Vec cannot fail.
        let _ = out.write_i16::<LittleEndian>(v as i16);
    }
    out
}

pub fn zero_byte_ratio(bytes: &[u8]) -> f32 {
    if bytes.is_empty() {
        return 1.0;
    }
    bytes.iter().filter(|&&b| b == 0).count() as f32 / bytes.len() as f32
}

/// Keep at most `max_bytes` from the end of `bytes`, on a sample boundary.
pub fn cap_tail(mut bytes: Vec<u8>, max_bytes: usize) -> Vec<u8> {
    let max_bytes = max_bytes & !1;
    if bytes.len() > max_bytes {
        bytes.drain(..bytes.len() - max_bytes);
    }
    bytes
}

/// Seconds of audio in a PCM16 buffer.
pub fn duration_secs(bytes: &[u8], sample_rate: u32, channels: u16) -> f64 {
    let frames = bytes.len() / (2 * usize::from(channels.max(1)));
    frames as f64 / f64::from(sample_rate.max(1))
}
