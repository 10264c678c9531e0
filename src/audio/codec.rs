//! # PCM Codec
//!
//! Converts between floating-point audio and the wire encoding the live
//! backend speaks: signed 16-bit little-endian PCM, base64 encoded.
//!
//! ## Audio Format:
//! - **Outbound**: mono, 16 kHz, tagged `audio/pcm;rate=16000`
//! - **Inbound**: mono, 24 kHz, no tag inspection
//!
//! Scaling to and from floats uses the full 16-bit range (32768).

use crate::error::VoiceError;
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Scale between `[-1.0, 1.0]` floats and signed 16-bit samples.
const PCM16_SCALE: f32 = 32768.0;

/// Byte-encoded audio frame plus a MIME-like descriptor carrying the rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAudioBlob {
    pub mime_type: String,
    pub data: String,
}

/// Encode one captured frame for transmission.
///
/// Each sample is multiplied by 32768, truncated toward zero and narrowed to
/// 16 bits with two's-complement wrap-around. Out-of-range input is not
/// clipped: a full-scale `1.0` comes out as `-32768`.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> WireAudioBlob {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let quantized = (sample * PCM16_SCALE) as i32 as i16;
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(quantized);
    }

    WireAudioBlob {
        mime_type: format!("audio/pcm;rate={}", sample_rate),
        data: encode_base64(&bytes),
    }
}

/// Unpack little-endian 16-bit samples. No scaling happens here.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<i16>, VoiceError> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decoding(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Scale 16-bit samples to floats in `[-1.0, 1.0)`.
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / PCM16_SCALE).collect()
}

/// Standard alphabet, padding optional.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Accepts padded or unpadded input; ASCII whitespace is ignored.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, VoiceError> {
    let compact: String;
    let input = if text.bytes().any(|b| b.is_ascii_whitespace()) {
        compact = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        compact.as_str()
    } else {
        text
    };

    LENIENT
        .decode(input)
        .map_err(|e| VoiceError::Decoding(format!("invalid base64 audio: {}", e)))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Full inbound path for one streamed fragment: base64 -> int16 -> float.
pub fn decode_fragment(text: &str) -> Result<Vec<f32>, VoiceError> {
    let bytes = decode_base64(text)?;
    let pcm = decode_pcm16(&bytes)?;
    Ok(pcm16_to_f32(&pcm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_frame_length_and_tag() {
        let frame = vec![0.25f32; 4096];
        let blob = encode_frame(&frame, 16000);

        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        let bytes = decode_base64(&blob.data).unwrap();
        assert_eq!(bytes.len(), 2 * 4096);
    }

    #[test]
    fn test_round_trip_reconstructs_quantized_samples() {
        let frame: Vec<f32> = (0..512).map(|i| ((i as f32) * 0.05).sin() * 0.8).collect();
        let expected: Vec<i16> = frame.iter().map(|&s| (s * 32768.0) as i32 as i16).collect();

        let blob = encode_frame(&frame, 16000);
        let decoded = decode_pcm16(&decode_base64(&blob.data).unwrap()).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_truncation_and_wrap() {
        let blob = encode_frame(&[0.5, -0.5, 0.99999, 1.0, -1.0], 16000);
        let decoded = decode_pcm16(&decode_base64(&blob.data).unwrap()).unwrap();

        assert_eq!(decoded[0], 16384);
        assert_eq!(decoded[1], -16384);
        assert_eq!(decoded[2], 32767);
        // 32768 does not fit and wraps, exactly like a typed-array store.
        assert_eq!(decoded[3], -32768);
        assert_eq!(decoded[4], -32768);
    }

    #[test]
    fn test_little_endian_layout() {
        let blob = encode_frame(&[1.0 / 32768.0 * 258.0], 16000);
        assert_eq!(decode_base64(&blob.data).unwrap(), vec![0x02, 0x01]);
    }

    #[test]
    fn test_decode_fragment_scales_to_float() {
        let bytes: Vec<u8> = [16384i16, -32768, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = decode_fragment(&encode_base64(&bytes)).unwrap();
        assert_eq!(samples, vec![0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_unpadded_and_wrapped_fragments_decode() {
        let bytes: Vec<u8> = [16384i16, -32768, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let padded = encode_base64(&bytes[..4]);
        assert!(padded.ends_with('='));

        let unpadded = padded.trim_end_matches('=');
        assert_eq!(decode_base64(unpadded).unwrap(), bytes[..4].to_vec());

        let encoded = encode_base64(&bytes);
        let wrapped = format!("{}\n{}", &encoded[..4], &encoded[4..]);
        assert_eq!(decode_fragment(&wrapped).unwrap(), vec![0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(decode_base64("not base64!!"), Err(VoiceError::Decoding(_))));
        assert!(matches!(decode_pcm16(&[1, 2, 3]), Err(VoiceError::Decoding(_))));
        assert!(matches!(decode_fragment(&encode_base64(&[7])), Err(VoiceError::Decoding(_))));
    }
}
