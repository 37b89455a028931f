//! Numeric helpers shared by the transform, estimation and subtraction stages

use num_complex::Complex64;

// ============================================================================
// Constants
// ============================================================================

/// Smallest value any subtraction coefficient may take
pub const COEFFICIENT_EPSILON: f64 = 1e-6;

/// Reference level of the equal-loudness contours, in phon
pub const LOUDNESS_REFERENCE_PHON: f64 = 60.0;

// ============================================================================
// Conversions
// ============================================================================

/// Clamp a coefficient to the strictly positive range
#[inline]
pub fn clamp_coefficient(value: f64) -> f64 {
    // NaN compares false, `max` picks the epsilon
    value.max(COEFFICIENT_EPSILON)
}

/// Convert linear amplitude to decibels
/// Returns -inf for zero or negative values
#[inline]
pub fn linear_to_db(linear: f64) -> f64 {
    if linear <= 0.0 {
        -f64::INFINITY
    } else {
        20.0 * linear.log10()
    }
}

// ============================================================================
// Spectrum Measurements
// ============================================================================

/// Power of a single bin (|X|^2)
#[inline]
pub fn bin_power(bin: Complex64) -> f64 {
    bin.re * bin.re + bin.im * bin.im
}

/// Write the power of every bin into `powers`
pub fn power_spectrum_into(spectrum: &[Complex64], powers: &mut [f64]) {
    for (p, &bin) in powers.iter_mut().zip(spectrum.iter()) {
        *p = bin_power(bin);
    }
}

/// Calculate RMS (Root Mean Square) of a buffer
#[inline]
pub fn calculate_rms(buffer: &[f64]) -> f64 {
    if buffer.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = buffer.iter().map(|&x| x * x).sum();
    (sum_squares / buffer.len() as f64).sqrt()
}

/// Median using quickselect (reorders `values`)
///
/// For even lengths the upper median is returned.
pub fn median_in_place(values: &mut [f64]) -> f64 {
    let len = values.len();
    if len == 0 {
        return 0.0;
    }

    let mid = len / 2;
    let (_, median, _) = values.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });

    *median
}
