//! PCM ingestion and egress
//!
//! Samples enter the context normalized to [-1, 1) by the full-scale value of
//! their bit depth (`2^(bits - 1)`) and leave it as 16-bit PCM, scaled back
//! by 32768, truncated toward zero and saturated to the i16 range.
//!
//! Raw PCM files are headerless little-endian i16. WAV files go through
//! `hound` and must be mono integer PCM.

use crate::context::{ContextError, DataSource, TransformContext};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Full-scale value of 16-bit PCM
pub const PCM16_FULL_SCALE: f64 = 32768.0;

/// Bit depths accepted from WAV files
pub const SUPPORTED_WAV_BITS: std::ops::RangeInclusive<u16> = 8..=32;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum PcmError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedFormat(String),

    #[error("Output buffer holds {got} samples, {expected} needed")]
    BufferTooSmall { expected: usize, got: usize },

    #[error(transparent)]
    Context(#[from] ContextError),
}

pub type Result<T> = std::result::Result<T, PcmError>;

// ============================================================================
// Sample Conversion
// ============================================================================

/// 16-bit sample to [-1, 1)
#[inline]
pub fn normalize_i16(sample: i16) -> f64 {
    sample as f64 / PCM16_FULL_SCALE
}

/// Integer sample of `bits` bits to [-1, 1)
#[inline]
pub fn normalize_int(sample: i32, bits: u16) -> f64 {
    sample as f64 / (1u64 << (bits.clamp(1, 32) - 1)) as f64
}

/// Normalized sample to 16-bit, truncating and saturating
#[inline]
pub fn denormalize_i16(sample: f64) -> i16 {
    // float to int casts saturate, NaN becomes 0
    (sample * PCM16_FULL_SCALE) as i16
}

// ============================================================================
// Context I/O
// ============================================================================

impl TransformContext {
    /// Load 16-bit samples held in memory
    pub fn read_pcm_buffer(&mut self, buffer: &[i16]) -> usize {
        let samples: Vec<f64> = buffer.iter().map(|&s| normalize_i16(s)).collect();
        self.replace_samples(samples, DataSource::Buffer);
        self.len()
    }

    /// Load a headerless little-endian 16-bit PCM file
    ///
    /// A trailing odd byte is ignored.
    pub fn read_pcm_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| PcmError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let samples: Vec<f64> = bytes
            .chunks_exact(2)
            .map(|pair| normalize_i16(i16::from_le_bytes([pair[0], pair[1]])))
            .collect();

        log::debug!("Read {} raw PCM samples from {}", samples.len(), path.display());
        self.replace_samples(samples, DataSource::File);
        Ok(self.len())
    }

    /// Load a mono integer WAV file and adopt its sample rate
    pub fn read_wav(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();

        if spec.channels != 1 {
            return Err(PcmError::UnsupportedFormat(format!(
                "{} channels, only mono is supported",
                spec.channels
            )));
        }
        if spec.sample_format != SampleFormat::Int {
            return Err(PcmError::UnsupportedFormat(
                "floating point samples, only integer PCM is supported".to_string(),
            ));
        }
        if !SUPPORTED_WAV_BITS.contains(&spec.bits_per_sample) {
            return Err(PcmError::UnsupportedFormat(format!(
                "{} bits per sample",
                spec.bits_per_sample
            )));
        }

        let samples = reader
            .samples::<i32>()
            .map(|s| s.map(|s| normalize_int(s, spec.bits_per_sample)))
            .collect::<std::result::Result<Vec<f64>, _>>()?;

        if spec.sample_rate != self.sample_rate() {
            self.set_sample_rate(spec.sample_rate)?;
        }

        log::debug!(
            "Read {} samples ({} bit, {} Hz) from {}",
            samples.len(),
            spec.bits_per_sample,
            spec.sample_rate,
            path.display()
        );
        self.replace_samples(samples, DataSource::File);
        Ok(self.len())
    }

    /// Render the working signal into `buffer`; returns the samples written
    pub fn write_pcm_buffer(&self, buffer: &mut [i16]) -> Result<usize> {
        let data = self.sample_data();
        if buffer.len() < data.len() {
            return Err(PcmError::BufferTooSmall {
                expected: data.len(),
                got: buffer.len(),
            });
        }

        for (out, &sample) in buffer.iter_mut().zip(data) {
            *out = denormalize_i16(sample);
        }
        Ok(data.len())
    }

    /// The working signal as 16-bit samples
    pub fn to_pcm(&self) -> Vec<i16> {
        self.sample_data().iter().map(|&s| denormalize_i16(s)).collect()
    }

    /// Write the working signal as headerless little-endian 16-bit PCM
    pub fn write_pcm_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes: Vec<u8> = self
            .sample_data()
            .iter()
            .flat_map(|&s| denormalize_i16(s).to_le_bytes())
            .collect();

        fs::write(path, bytes).map_err(|source| PcmError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Write the working signal as a mono 16-bit WAV at the context's rate
    pub fn write_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate(),
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let mut writer = WavWriter::create(path, spec)?;
        for &sample in self.sample_data() {
            writer.write_sample(denormalize_i16(sample))?;
        }
        writer.finalize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_i16_survives_normalization(sample in any::<i16>()) {
            let normalized = normalize_i16(sample);
            prop_assert!((-1.0..1.0).contains(&normalized));
            prop_assert_eq!(denormalize_i16(normalized), sample);
        }
    }

    #[test]
    fn test_denormalize_truncates_and_saturates() {
        assert_eq!(denormalize_i16(1.5), i16::MAX);
        assert_eq!(denormalize_i16(-2.0), i16::MIN);
        assert_eq!(denormalize_i16(0.999_99), 32767);
        assert_eq!(denormalize_i16(-0.000_01), 0);
        assert_eq!(denormalize_i16(100.7 / PCM16_FULL_SCALE), 100);
        assert_eq!(denormalize_i16(f64::NAN), 0);
    }

    #[test]
    fn test_normalize_int_depths() {
        assert_abs_diff_eq!(normalize_int(-128, 8), -1.0);
        assert_abs_diff_eq!(normalize_int(64, 8), 0.5);
        assert_abs_diff_eq!(normalize_int(1 << 22, 24), 0.5);
        assert_abs_diff_eq!(normalize_int(i32::MIN, 32), -1.0);
    }

    #[test]
    fn test_buffer_round_trip() {
        let mut context = TransformContext::new(16, 16000).unwrap();
        let pcm = [0i16, 1, -1, 12345, -32768, 32767];

        assert_eq!(context.read_pcm_buffer(&pcm), 6);
        assert_eq!(context.data_source(), DataSource::Buffer);
        assert_abs_diff_eq!(context.original_data()[4], -1.0);
        assert_eq!(context.to_pcm(), pcm.to_vec());

        let mut out = [0i16; 8];
        assert_eq!(context.write_pcm_buffer(&mut out).unwrap(), 6);
        assert_eq!(&out[..6], &pcm[..]);
        assert!(matches!(
            context.write_pcm_buffer(&mut [0i16; 2]),
            Err(PcmError::BufferTooSmall { expected: 6, got: 2 })
        ));
    }

    #[test]
    fn test_raw_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.raw");
        let output = dir.path().join("out.raw");

        let mut bytes: Vec<u8> = [300i16, -2, 0, i16::MIN]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        bytes.push(0x7f);
        fs::write(&input, &bytes).unwrap();

        let mut context = TransformContext::new(16, 16000).unwrap();
        assert_eq!(context.read_pcm_file(&input).unwrap(), 4);
        assert_eq!(context.data_source(), DataSource::File);

        context.write_pcm_file(&output).unwrap();
        assert_eq!(fs::read(&output).unwrap(), bytes[..8].to_vec());

        assert!(matches!(
            context.read_pcm_file(dir.path().join("missing.raw")),
            Err(PcmError::Io { .. })
        ));
    }

    #[test]
    fn test_wav_round_trip_adopts_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");

        let mut source = TransformContext::new(16, 22050).unwrap();
        source.read_pcm_buffer(&[1000, -1000, 5, 0, 32767]);
        source.write_wav(&path).unwrap();

        let mut context = TransformContext::new(16, 16000).unwrap();
        assert_eq!(context.read_wav(&path).unwrap(), 5);
        assert_eq!(context.sample_rate(), 22050);
        assert_eq!(context.to_pcm(), vec![1000, -1000, 5, 0, 32767]);
    }

    #[test]
    fn test_wav_rejects_stereo_and_float() {
        let dir = tempfile::tempdir().unwrap();

        let stereo = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&stereo, spec).unwrap();
        writer.write_sample(1i16).unwrap();
        writer.write_sample(2i16).unwrap();
        writer.finalize().unwrap();

        let float = dir.path().join("float.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&float, spec).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();

        let mut context = TransformContext::new(16, 16000).unwrap();
        assert!(matches!(context.read_wav(&stereo), Err(PcmError::UnsupportedFormat(_))));
        assert!(matches!(context.read_wav(&float), Err(PcmError::UnsupportedFormat(_))));
        assert!(context.is_empty());
    }
}
