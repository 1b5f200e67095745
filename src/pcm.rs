//! PCM wire codec
//!
//! Outbound audio is float samples scaled to signed 16-bit little-endian PCM
//! and base64-encoded. Inbound audio is the reverse, scaled by 1/32768.

use crate::media::{MediaBlob, PCM_INPUT_MIME};
use base64::engine::general_purpose;
use base64::Engine;

/// Error decoding an inbound PCM payload
#[derive(Debug, thiserror::Error)]
pub enum PcmError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Convert one float sample in [-1.0, 1.0] to i16, clamping out-of-range input.
pub fn f32_to_i16(sample: f32) -> i16 {
    // NaN survives clamp and then casts to 0
    (sample * 32767.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode float samples as little-endian 16-bit PCM.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Encode a capture window into the realtime audio blob.
pub fn encode_audio_blob(samples: &[f32]) -> MediaBlob {
    MediaBlob {
        mime_type: PCM_INPUT_MIME.to_string(),
        data: general_purpose::STANDARD.encode(encode_pcm16(samples)),
    }
}

/// Decode little-endian 16-bit PCM into floats. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Decode a base64 PCM16 payload into floats.
pub fn decode_base64_pcm(payload: &str) -> Result<Vec<f32>, PcmError> {
    let bytes = general_purpose::STANDARD.decode(payload)?;
    Ok(decode_pcm16(&bytes))
}
