use std::{fs, path::Path};

use crate::audio::to_pcm16;
use crate::error::Result;

/// Size of the canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

/// Placeholder for the RIFF and data sizes of a stream whose length is not
/// known when the header goes out. Lenient players (browsers, ffmpeg) read
/// until EOF; strict parsers reject it.
pub const UNKNOWN_SIZE: u32 = u32::MAX;

const NUM_CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;

/// Build a 16-bit mono PCM WAV header.
///
/// `data_size = None` writes [`UNKNOWN_SIZE`] into both size fields so the
/// header can precede PCM data of unknown length.
pub fn wav_header(sample_rate: u32, data_size: Option<u32>) -> [u8; WAV_HEADER_LEN] {
    let byte_rate: u32 = sample_rate.saturating_mul(NUM_CHANNELS as u32 * (BITS_PER_SAMPLE as u32 / 8));
    let block_align: u16 = NUM_CHANNELS * (BITS_PER_SAMPLE / 8);
    let (riff_size, data_size) = match data_size {
        Some(size) => (36u32.saturating_add(size), size),
        None => (UNKNOWN_SIZE, UNKNOWN_SIZE),
    };

    let mut out = [0u8; WAV_HEADER_LEN];
    let mut put = |offset: usize, bytes: &[u8]| {
        out[offset..offset + bytes.len()].copy_from_slice(bytes);
    };

    // RIFF header
    put(0, b"RIFF");
    put(4, &riff_size.to_le_bytes());
    put(8, b"WAVE");

    // fmt chunk
    put(12, b"fmt ");
    put(16, &16u32.to_le_bytes()); // fmt chunk size
    put(20, &1u16.to_le_bytes()); // PCM
    put(22, &NUM_CHANNELS.to_le_bytes());
    put(24, &sample_rate.to_le_bytes());
    put(28, &byte_rate.to_le_bytes());
    put(32, &block_align.to_le_bytes());
    put(34, &BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    put(36, b"data");
    put(40, &data_size.to_le_bytes());

    out
}

fn spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: NUM_CHANNELS,
        sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Write f32 samples to `path` as a 16-bit PCM WAV file, creating parent
/// directories as needed.
pub fn write_wav_file(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = hound::WavWriter::create(path, spec(sample_rate))?;
    for v in to_pcm16(samples) {
        writer.write_sample(v)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn streaming_header_uses_sentinel_sizes() {
        let header = wav_header(24_000, None);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[36..40], b"data");
        assert_eq!(u32_at(&header, 4), UNKNOWN_SIZE);
        assert_eq!(u32_at(&header, 40), UNKNOWN_SIZE);
        assert_eq!(u32_at(&header, 24), 24_000);
        assert_eq!(u32_at(&header, 28), 48_000);
    }

    #[test]
    fn huge_sample_rate_saturates_byte_rate() {
        let header = wav_header(u32::MAX, None);
        assert_eq!(u32_at(&header, 24), u32::MAX);
        assert_eq!(u32_at(&header, 28), u32::MAX);
    }

    #[test]
    fn sized_header_matches_hound_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("four.wav");
        let samples = vec![0.0f32, 0.5, -0.5, 1.0];
        write_wav_file(&path, &samples, 16_000).unwrap();

        let encoded = std::fs::read(&path).unwrap();
        assert_eq!(encoded.len(), WAV_HEADER_LEN + samples.len() * 2);
        assert_eq!(&encoded[..WAV_HEADER_LEN], &wav_header(16_000, Some(8))[..]);
    }

    #[test]
    fn writes_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.wav");
        write_wav_file(&path, &[0.25; 160], 16_000).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().bits_per_sample, 16);
        assert_eq!(reader.len(), 160);
    }
}
