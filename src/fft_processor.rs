//! Real-input FFT/IFFT for frame-based spectral processing
//!
//! Signals are real, so only the non-redundant half of the spectrum
//! (`N/2 + 1` bins, DC through Nyquist) is exchanged with callers. The
//! transforms are unnormalized in both directions: a forward transform
//! followed by an inverse one yields the input scaled by `N`.

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Minimum transform size supported
pub const MIN_TRANSFORM_SIZE: usize = 2;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("Invalid transform size: {size}. Must be even and at least {MIN_TRANSFORM_SIZE}")]
    InvalidSize { size: usize },

    #[error("Buffer size mismatch. Expected {expected}, got {got}")]
    BufferSizeMismatch { expected: usize, got: usize },
}

/// Check that `size` is a usable transform size
pub fn validate_transform_size(size: usize) -> Result<(), TransformError> {
    if size < MIN_TRANSFORM_SIZE || size % 2 != 0 {
        return Err(TransformError::InvalidSize { size });
    }
    Ok(())
}

/// Number of non-redundant bins of a real transform of `transform_size` points
#[inline]
pub fn spectrum_size_for(transform_size: usize) -> usize {
    transform_size / 2 + 1
}

/// Transform dimensions handed to strategies on every size change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformGeometry {
    pub transform_size: usize,
    pub spectrum_size: usize,
    pub sample_rate: u32,
}

impl TransformGeometry {
    pub fn new(transform_size: usize, sample_rate: u32) -> Self {
        Self {
            transform_size,
            spectrum_size: spectrum_size_for(transform_size),
            sample_rate,
        }
    }
}

// ============================================================================
// Real FFT Processor
// ============================================================================

/// Forward and inverse plans for one transform size
pub struct RealFftProcessor {
    transform_size: usize,
    spectrum_size: usize,
    fft_forward: Arc<dyn Fft<f64>>,
    fft_inverse: Arc<dyn Fft<f64>>,

    // Working buffers (pre-allocated)
    complex_buffer: Vec<Complex64>,
    scratch: Vec<Complex64>,
}

impl RealFftProcessor {
    /// Plan forward and inverse transforms of `transform_size` points
    pub fn new(transform_size: usize) -> Result<Self, TransformError> {
        validate_transform_size(transform_size)?;

        let mut planner = FftPlanner::new();
        let fft_forward = planner.plan_fft_forward(transform_size);
        let fft_inverse = planner.plan_fft_inverse(transform_size);

        let scratch_len = fft_forward
            .get_inplace_scratch_len()
            .max(fft_inverse.get_inplace_scratch_len());

        Ok(Self {
            transform_size,
            spectrum_size: spectrum_size_for(transform_size),
            fft_forward,
            fft_inverse,
            complex_buffer: vec![Complex64::new(0.0, 0.0); transform_size],
            scratch: vec![Complex64::new(0.0, 0.0); scratch_len],
        })
    }

    /// Get the transform size
    #[inline]
    pub fn transform_size(&self) -> usize {
        self.transform_size
    }

    /// Get the number of non-redundant bins
    #[inline]
    pub fn spectrum_size(&self) -> usize {
        self.spectrum_size
    }

    /// Real-to-complex forward transform
    ///
    /// `input` holds `transform_size` samples, `spectrum` receives
    /// `spectrum_size` bins.
    pub fn forward(&mut self, input: &[f64], spectrum: &mut [Complex64]) -> Result<(), TransformError> {
        self.check_lengths(input.len(), spectrum.len())?;

        for (c, &sample) in self.complex_buffer.iter_mut().zip(input.iter()) {
            *c = Complex64::new(sample, 0.0);
        }

        self.fft_forward
            .process_with_scratch(&mut self.complex_buffer, &mut self.scratch);

        spectrum.copy_from_slice(&self.complex_buffer[..self.spectrum_size]);
        Ok(())
    }

    /// Complex-to-real inverse transform (unnormalized)
    ///
    /// The negative-frequency half is rebuilt by conjugate mirroring. The
    /// imaginary parts of the DC and Nyquist bins are ignored.
    pub fn inverse(&mut self, spectrum: &[Complex64], output: &mut [f64]) -> Result<(), TransformError> {
        self.check_lengths(output.len(), spectrum.len())?;

        let n = self.transform_size;
        let half = n / 2;

        self.complex_buffer[0] = Complex64::new(spectrum[0].re, 0.0);
        for k in 1..half {
            self.complex_buffer[k] = spectrum[k];
            self.complex_buffer[n - k] = spectrum[k].conj();
        }
        self.complex_buffer[half] = Complex64::new(spectrum[half].re, 0.0);

        self.fft_inverse
            .process_with_scratch(&mut self.complex_buffer, &mut self.scratch);

        for (out, c) in output.iter_mut().zip(self.complex_buffer.iter()) {
            *out = c.re;
        }
        Ok(())
    }

    /// Get frequency in Hz of a bin
    #[inline]
    pub fn bin_frequency(&self, bin: usize, sample_rate: u32) -> f64 {
        (bin as f64 * sample_rate as f64) / (self.transform_size as f64)
    }

    fn check_lengths(&self, samples: usize, bins: usize) -> Result<(), TransformError> {
        if samples != self.transform_size {
            return Err(TransformError::BufferSizeMismatch {
                expected: self.transform_size,
                got: samples,
            });
        }
        if bins != self.spectrum_size {
            return Err(TransformError::BufferSizeMismatch {
                expected: self.spectrum_size,
                got: bins,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
