//! Linear-interpolation resampling between the client's sample rate and the
//! 16 kHz the STT/TTS providers require, on 16-bit signed little-endian
//! mono PCM.

use crate::error::{ClassifiedError, ErrorKind};

pub const SUPPORTED_RATES: [u32; 5] = [8000, 16000, 24000, 32000, 48000];

fn invalid(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError {
        kind: ErrorKind::InvalidRequest,
        message: message.into(),
        status_code: None,
    }
}

/// Resample a buffer of s16le mono PCM samples from `sr_in` to `sr_out`.
///
/// Output length is `floor(input_len * sr_out / sr_in)`. Endpoints are
/// clamped to the source buffer's range; no windowing or anti-aliasing
/// beyond linear interpolation is applied.
pub fn resample(bytes: &[u8], sr_in: u32, sr_out: u32) -> Result<Vec<u8>, ClassifiedError> {
    if bytes.len() % 2 != 0 {
        return Err(invalid("odd byte count: not whole 16-bit samples"));
    }
    if bytes.is_empty() {
        return Err(invalid("empty audio buffer"));
    }
    if !SUPPORTED_RATES.contains(&sr_in) || !SUPPORTED_RATES.contains(&sr_out) {
        return Err(invalid(format!(
            "unsupported sample rate: {sr_in} -> {sr_out}"
        )));
    }

    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    if sr_in == sr_out {
        return Ok(bytes.to_vec());
    }

    let in_len = samples.len();
    let out_len = (in_len as u64 * sr_out as u64 / sr_in as u64) as usize;
    let mut out = Vec::with_capacity(out_len * 2);

    for i in 0..out_len {
        let src_pos = i as f64 * sr_in as f64 / sr_out as f64;
        let idx0 = src_pos.floor() as usize;
        let idx0 = idx0.min(in_len - 1);
        let idx1 = (idx0 + 1).min(in_len - 1);
        let frac = src_pos - idx0 as f64;

        let s0 = samples[idx0] as f64;
        let s1 = samples[idx1] as f64;
        let interpolated = s0 + (s1 - s0) * frac;
        let clamped = interpolated.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        out.extend_from_slice(&clamped.to_le_bytes());
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_odd_byte_count_rejected() {
        let err = resample(&[0u8, 1, 2], 16000, 48000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_empty_buffer_rejected() {
        let err = resample(&[], 16000, 48000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_unsupported_rate_rejected() {
        let data = pcm(&[0, 1, 2, 3]);
        let err = resample(&data, 16000, 44100).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_same_rate_is_identity() {
        let data = pcm(&[1, 2, 3, 4]);
        let out = resample(&data, 16000, 16000).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_upsample_length_law() {
        let data = pcm(&[0; 1600]); // 100ms @ 16kHz
        let out = resample(&data, 16000, 48000).unwrap();
        assert_eq!(out.len() / 2, 4800);
    }

    #[test]
    fn test_downsample_length_law() {
        let data = pcm(&[0; 4800]); // 100ms @ 48kHz
        let out = resample(&data, 48000, 16000).unwrap();
        assert_eq!(out.len() / 2, 1600);
    }

    #[test]
    fn test_round_trip_length_within_one_sample() {
        let original = pcm(&(0..4800).map(|i| (i % 1000) as i16).collect::<Vec<_>>());
        let down = resample(&original, 48000, 16000).unwrap();
        let back = resample(&down, 16000, 48000).unwrap();
        let orig_samples = original.len() / 2;
        let back_samples = back.len() / 2;
        assert!((orig_samples as i64 - back_samples as i64).unsigned_abs() <= 1);
    }

    #[test]
    fn test_interpolated_values_between_endpoints() {
        let data = pcm(&[0, 1000]);
        let out = resample(&data, 16000, 32000).unwrap();
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples[0], 0);
        for &s in &samples {
            assert!((0..=1000).contains(&s));
        }
    }
}
