//! PCM sample conversion
//! Byte/sample conversion, linear resampling, concatenation and silence for 16-bit mono PCM

use base64::Engine;

/// Sample rates the conversational agent accepts for microphone input
pub const SUPPORTED_AGENT_RATES: [u32; 6] = [8000, 16000, 22050, 24000, 44100, 48000];

/// Decode little-endian 16-bit PCM bytes into samples.
/// A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as little-endian 16-bit PCM bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Convert float samples (-1.0..1.0) to 16-bit PCM.
/// Negative values scale by 0x8000, positive by 0x7fff.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Number of output samples produced when resampling `input_len` samples
pub fn resampled_len(input_len: usize, source_rate: u32, target_rate: u32) -> usize {
    if source_rate == target_rate {
        return input_len;
    }
    let ratio = source_rate as f64 / target_rate as f64;
    (input_len as f64 / ratio).round() as usize
}

/// Linear-interpolation resampling of 16-bit samples.
///
/// For output index `i` the source position is `i * (source_rate / target_rate)`;
/// the two neighbouring source samples are blended, rounded and clamped to the
/// i16 range.
pub fn resample_linear(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = resampled_len(samples.len(), source_rate, target_rate);
    let last = samples.len() - 1;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let source_index = i as f64 * ratio;
        let index_floor = (source_index.floor() as usize).min(last);
        let index_ceil = (index_floor + 1).min(last);
        let fraction = source_index - index_floor as f64;

        let blended = samples[index_floor] as f64 * (1.0 - fraction)
            + samples[index_ceil] as f64 * fraction;
        let value = blended.round().clamp(i16::MIN as f64, i16::MAX as f64);
        output.push(value as i16);
    }

    output
}

/// Resample a PCM byte chunk. Equal rates hand back the very same buffer.
pub fn resample_bytes(chunk: Vec<u8>, source_rate: u32, target_rate: u32) -> Vec<u8> {
    if source_rate == target_rate {
        return chunk;
    }
    let samples = bytes_to_samples(&chunk);
    samples_to_bytes(&resample_linear(&samples, source_rate, target_rate))
}

/// Concatenate chunks in order. A single chunk is returned as-is.
pub fn concat_chunks(mut chunks: Vec<Vec<u8>>) -> Vec<u8> {
    match chunks.len() {
        0 => Vec::new(),
        1 => chunks.pop().unwrap_or_default(),
        _ => {
            let total: usize = chunks.iter().map(Vec::len).sum();
            let mut out = Vec::with_capacity(total);
            for chunk in &chunks {
                out.extend_from_slice(chunk);
            }
            out
        }
    }
}

/// Split a concatenated payload back at the given chunk lengths.
/// Bytes beyond the listed lengths end up in a final extra chunk.
pub fn split_at_boundaries(payload: &[u8], lengths: &[usize]) -> Vec<Vec<u8>> {
    let mut parts = Vec::with_capacity(lengths.len() + 1);
    let mut offset = 0;
    for &len in lengths {
        let end = (offset + len).min(payload.len());
        parts.push(payload[offset..end].to_vec());
        offset = end;
    }
    if offset < payload.len() {
        parts.push(payload[offset..].to_vec());
    }
    parts
}

/// Zeroed 16-bit PCM covering `duration_ms` at `sample_rate`
pub fn silence(duration_ms: u64, sample_rate: u32) -> Vec<u8> {
    let samples = (duration_ms as u128 * sample_rate as u128 / 1000) as usize;
    vec![0u8; samples * 2]
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data)
}

/// Closest rate the agent accepts for microphone input
pub fn closest_supported_rate(sample_rate: u32) -> u32 {
    SUPPORTED_AGENT_RATES
        .iter()
        .copied()
        .min_by_key(|rate| rate.abs_diff(sample_rate))
        .unwrap_or(16000)
}

/// Agent audio format string (`pcm_<rate>`) for a microphone rate
pub fn input_audio_format(sample_rate: u32) -> String {
    format!("pcm_{}", closest_supported_rate(sample_rate))
}

/// Extract the rate from a `pcm_<rate>` format string
pub fn parse_pcm_format(format: &str) -> Option<u32> {
    let start = format.find("pcm_")? + 4;
    let digits: String = format[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|rate| *rate > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| (i as i16) * 10 - 2000).collect()
    }

    #[test]
    fn test_same_rate_is_identity() {
        let odd = vec![1u8, 2, 3, 4, 5];
        let ptr = odd.as_ptr();
        let out = resample_bytes(odd, 24000, 24000);
        assert_eq!(out, vec![1u8, 2, 3, 4, 5]);
        assert_eq!(out.as_ptr(), ptr, "same-rate chunk must not be copied");

        let samples = ramp(37);
        assert_eq!(resample_linear(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resampled_length() {
        assert_eq!(resample_linear(&ramp(160), 16000, 24000).len(), 240);
        assert_eq!(resample_linear(&ramp(441), 44100, 24000).len(), 240);
        assert_eq!(resample_linear(&ramp(3), 16000, 24000).len(), 5); // round(4.5)
        assert_eq!(resample_linear(&[], 16000, 24000).len(), 0);
    }

    #[test]
    fn test_upsample_interpolates() {
        let out = resample_linear(&[0, 100, 200, 300], 16000, 32000);
        assert_eq!(out, vec![0, 50, 100, 150, 200, 250, 300, 300]);
    }

    #[test]
    fn test_monotonic_input_stays_monotonic() {
        let out = resample_linear(&ramp(500), 22050, 24000);
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_extremes_are_clamped() {
        let out = resample_linear(&[i16::MAX, i16::MIN, i16::MAX], 16000, 24000);
        assert!(out.iter().all(|s| *s >= i16::MIN && *s <= i16::MAX));
        assert_eq!(out[0], i16::MAX);
    }

    #[test]
    fn test_concat_then_split_round_trip() {
        let a = vec![1u8, 2, 3, 4];
        let b = vec![5u8, 6];
        let c = vec![7u8, 8, 9, 10, 11, 12];
        let lengths = [a.len(), b.len(), c.len()];
        let joined = concat_chunks(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(split_at_boundaries(&joined, &lengths), vec![a, b, c]);
    }

    #[test]
    fn test_single_chunk_bypasses_concat() {
        let only = vec![9u8; 10];
        let ptr = only.as_ptr();
        let out = concat_chunks(vec![only]);
        assert_eq!(out.as_ptr(), ptr);
    }

    #[test]
    fn test_silence_length() {
        assert_eq!(silence(150, 24000).len(), 3600 * 2);
        assert!(silence(150, 24000).iter().all(|b| *b == 0));
    }

    #[test]
    fn test_format_negotiation() {
        assert_eq!(input_audio_format(48000), "pcm_48000");
        assert_eq!(input_audio_format(44000), "pcm_44100");
        assert_eq!(input_audio_format(96000), "pcm_48000");
        assert_eq!(parse_pcm_format("pcm_16000"), Some(16000));
        assert_eq!(parse_pcm_format("ulaw_8000"), None);
    }

    #[test]
    fn test_float_conversion_bounds() {
        assert_eq!(f32_to_i16(&[-1.0, 0.0, 1.0, 2.0]), vec![-32768, 0, 32767, 32767]);
    }
}
