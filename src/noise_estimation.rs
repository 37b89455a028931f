//! Noise power estimation
//!
//! An estimator looks at every frame the context processes (its complex
//! spectrum and the raw samples it was computed from) and maintains a
//! per-bin estimate of the noise power, in the same unnormalized units as
//! `|X[k]|^2` of the forward transform.
//!
//! # Thread Safety
//! Estimators are shared with the context through `Rc<RefCell<_>>` and are
//! not thread-safe.

use crate::fft_processor::TransformGeometry;
use crate::utils::{bin_power, median_in_place, power_spectrum_into};
use num_complex::Complex64;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

// ============================================================================
// Constants
// ============================================================================

/// Smoothing factor of the Martin periodogram
pub const MARTIN_SMOOTHING: f64 = 0.85;

/// Number of sub-windows the Martin minimum search spans
pub const MARTIN_SUBWINDOWS: usize = 8;

/// Frames per Martin sub-window
pub const MARTIN_SUBWINDOW_LEN: usize = 12;

/// Compensation for the downward bias of a minimum over a smoothed periodogram
pub const MARTIN_BIAS: f64 = 1.5;

/// Median absolute deviation of a unit gaussian
const MAD_TO_SIGMA: f64 = 0.6745;

/// Smoothing factor applied to successive wavelet estimates
pub const WAVELET_SMOOTHING: f64 = 0.9;

/// Fewest detail coefficients a Haar level needs to give a usable median
pub const WAVELET_MIN_COEFFICIENTS: usize = 8;

// ============================================================================
// Strategy Interface
// ============================================================================

/// Available estimation algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimationAlgorithm {
    /// Power spectrum of the quietest frame
    Simple,
    /// Minimum statistics over a smoothed periodogram
    Martin,
    /// Haar decomposition of the raw frame
    Wavelet,
}

impl EstimationAlgorithm {
    /// Token used in parameter files
    pub fn token(&self) -> &'static str {
        match self {
            EstimationAlgorithm::Simple => "std",
            EstimationAlgorithm::Martin => "martin",
            EstimationAlgorithm::Wavelet => "wavelets",
        }
    }

    /// Create a fresh, unattached estimator of this kind
    pub fn create(&self) -> SharedEstimator {
        match self {
            EstimationAlgorithm::Simple => shared_estimator(SimpleEstimator::new()),
            EstimationAlgorithm::Martin => shared_estimator(MartinEstimator::new()),
            EstimationAlgorithm::Wavelet => shared_estimator(WaveletEstimator::new()),
        }
    }
}

impl fmt::Display for EstimationAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for EstimationAlgorithm {
    type Err = String;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "std" => Ok(EstimationAlgorithm::Simple),
            "martin" => Ok(EstimationAlgorithm::Martin),
            "wavelets" => Ok(EstimationAlgorithm::Wavelet),
            other => Err(format!("unknown estimation algorithm '{}'", other)),
        }
    }
}

/// Produces and refines a per-bin noise power estimate
pub trait NoiseEstimator {
    /// Feed one frame; returns true when the estimate changed
    fn update(&mut self, spectrum: &[Complex64], frame: &[f64]) -> bool;

    /// Current estimate, `spectrum_size` non-negative values
    ///
    /// All zeros until the first frame has been seen.
    fn noise_power(&self) -> &[f64];

    /// The transform size or sample rate changed; estimates are discarded
    fn on_transform_size_changed(&mut self, geometry: &TransformGeometry);

    /// New input data was loaded
    fn on_input_data_changed(&mut self);

    fn algorithm(&self) -> EstimationAlgorithm;
}

/// Estimator handle shared between the context and whoever configured it
pub type SharedEstimator = Rc<RefCell<dyn NoiseEstimator>>;

/// Wrap an estimator into a shared handle
pub fn shared_estimator<E: NoiseEstimator + 'static>(estimator: E) -> SharedEstimator {
    Rc::new(RefCell::new(estimator))
}

// ============================================================================
// Simple Estimator
// ============================================================================

/// Keeps the power spectrum of the lowest-energy frame seen so far
///
/// Frames with zero energy (digital silence, trailing padding) carry no
/// information about the noise and are skipped.
pub struct SimpleEstimator {
    noise_power: Vec<f64>,
    frame_power: Vec<f64>,
    min_energy: f64,
}

impl SimpleEstimator {
    pub fn new() -> Self {
        Self {
            noise_power: Vec::new(),
            frame_power: Vec::new(),
            min_energy: f64::INFINITY,
        }
    }

    /// Energy of the frame currently used as the estimate
    pub fn min_energy(&self) -> Option<f64> {
        self.min_energy.is_finite().then_some(self.min_energy)
    }
}

impl Default for SimpleEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseEstimator for SimpleEstimator {
    fn update(&mut self, spectrum: &[Complex64], _frame: &[f64]) -> bool {
        self.frame_power.resize(spectrum.len(), 0.0);
        power_spectrum_into(spectrum, &mut self.frame_power);

        let energy: f64 = self.frame_power.iter().sum();
        if energy > 0.0 && energy < self.min_energy {
            self.min_energy = energy;
            self.noise_power.clear();
            self.noise_power.extend_from_slice(&self.frame_power);
            return true;
        }
        false
    }

    fn noise_power(&self) -> &[f64] {
        &self.noise_power
    }

    fn on_transform_size_changed(&mut self, geometry: &TransformGeometry) {
        self.noise_power = vec![0.0; geometry.spectrum_size];
        self.frame_power = vec![0.0; geometry.spectrum_size];
        self.min_energy = f64::INFINITY;
    }

    fn on_input_data_changed(&mut self) {
        self.noise_power.fill(0.0);
        self.min_energy = f64::INFINITY;
    }

    fn algorithm(&self) -> EstimationAlgorithm {
        EstimationAlgorithm::Simple
    }
}

// ============================================================================
// Sub-window Minima Ring Buffer
// ============================================================================

/// Ring of per-bin minima, one entry per completed sub-window
struct MinimaRingBuffer {
    buffer: Vec<Vec<f64>>,
    capacity: usize,
    write_index: usize,
    size: usize,
}

impl MinimaRingBuffer {
    fn new(capacity: usize, spectrum_size: usize) -> Self {
        let buffer = (0..capacity)
            .map(|_| vec![f64::INFINITY; spectrum_size])
            .collect();

        Self {
            buffer,
            capacity,
            write_index: 0,
            size: 0,
        }
    }

    fn push(&mut self, minima: &[f64]) {
        self.buffer[self.write_index].copy_from_slice(minima);
        self.write_index = (self.write_index + 1) % self.capacity;
        self.size = self.size.saturating_add(1).min(self.capacity);
    }

    /// Smallest stored value of one bin
    fn min_at(&self, bin: usize) -> f64 {
        self.buffer[..self.size]
            .iter()
            .map(|minima| minima[bin])
            .fold(f64::INFINITY, f64::min)
    }

    fn clear(&mut self) {
        self.write_index = 0;
        self.size = 0;
    }
}

// ============================================================================
// Martin Estimator
// ============================================================================

/// Minimum statistics noise tracking
///
/// The periodogram is smoothed recursively and its minimum is searched over
/// the last `MARTIN_SUBWINDOWS * MARTIN_SUBWINDOW_LEN` frames. Speech raises
/// the periodogram only temporarily, so the minimum follows the noise floor
/// even while speech is present.
pub struct MartinEstimator {
    smoothing: f64,
    bias: f64,
    smoothed: Vec<f64>,
    current_min: Vec<f64>,
    minima: MinimaRingBuffer,
    frame_in_subwindow: usize,
    frames_seen: usize,
    noise_power: Vec<f64>,
}

impl MartinEstimator {
    pub fn new() -> Self {
        Self::with_parameters(MARTIN_SMOOTHING, MARTIN_BIAS)
    }

    /// Custom smoothing (clamped to [0, 0.999]) and bias (at least 1)
    pub fn with_parameters(smoothing: f64, bias: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(0.0, 0.999),
            bias: bias.max(1.0),
            smoothed: Vec::new(),
            current_min: Vec::new(),
            minima: MinimaRingBuffer::new(MARTIN_SUBWINDOWS, 0),
            frame_in_subwindow: 0,
            frames_seen: 0,
            noise_power: Vec::new(),
        }
    }

    pub fn frames_seen(&self) -> usize {
        self.frames_seen
    }

    fn reset_tracking(&mut self) {
        self.smoothed.fill(0.0);
        self.current_min.fill(f64::INFINITY);
        self.minima.clear();
        self.frame_in_subwindow = 0;
        self.frames_seen = 0;
        self.noise_power.fill(0.0);
    }
}

impl Default for MartinEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseEstimator for MartinEstimator {
    fn update(&mut self, spectrum: &[Complex64], _frame: &[f64]) -> bool {
        let bins = spectrum.len().min(self.smoothed.len());
        let a = self.smoothing;

        for (k, &bin) in spectrum.iter().enumerate().take(bins) {
            let power = bin_power(bin);
            self.smoothed[k] = if self.frames_seen == 0 {
                power
            } else {
                a * self.smoothed[k] + (1.0 - a) * power
            };
            self.current_min[k] = self.current_min[k].min(self.smoothed[k]);
        }

        self.frames_seen += 1;
        self.frame_in_subwindow += 1;
        if self.frame_in_subwindow == MARTIN_SUBWINDOW_LEN {
            self.minima.push(&self.current_min);
            self.current_min.fill(f64::INFINITY);
            self.frame_in_subwindow = 0;
        }

        for k in 0..bins {
            let minimum = self.current_min[k].min(self.minima.min_at(k));
            self.noise_power[k] = if minimum.is_finite() {
                self.bias * minimum
            } else {
                0.0
            };
        }
        true
    }

    fn noise_power(&self) -> &[f64] {
        &self.noise_power
    }

    fn on_transform_size_changed(&mut self, geometry: &TransformGeometry) {
        let bins = geometry.spectrum_size;
        self.smoothed = vec![0.0; bins];
        self.current_min = vec![f64::INFINITY; bins];
        self.minima = MinimaRingBuffer::new(MARTIN_SUBWINDOWS, bins);
        self.noise_power = vec![0.0; bins];
        self.frame_in_subwindow = 0;
        self.frames_seen = 0;
    }

    fn on_input_data_changed(&mut self) {
        self.reset_tracking();
    }

    fn algorithm(&self) -> EstimationAlgorithm {
        EstimationAlgorithm::Martin
    }
}

// ============================================================================
// Wavelet Estimator
// ============================================================================

/// Noise level from a Haar decomposition of the raw frame
///
/// Every decomposition level covers one octave of the spectrum. The noise
/// deviation of a level is the median absolute detail coefficient scaled to
/// a gaussian (`sigma = median(|d|) / 0.6745`), which is insensitive to the
/// few large coefficients a tonal or speech component produces. Bins of an
/// octave receive the white-noise power that sigma implies for the frame
/// length. Levels with fewer than `WAVELET_MIN_COEFFICIENTS` coefficients
/// reuse the deviation of the finer level above them.
pub struct WaveletEstimator {
    smoothing: f64,
    transform_size: usize,
    noise_power: Vec<f64>,
    approximation: Vec<f64>,
    details: Vec<f64>,
    frames_seen: usize,
}

impl WaveletEstimator {
    pub fn new() -> Self {
        Self {
            smoothing: WAVELET_SMOOTHING,
            transform_size: 0,
            noise_power: Vec::new(),
            approximation: Vec::new(),
            details: Vec::new(),
            frames_seen: 0,
        }
    }

    /// Per-level noise deviations of a frame, finest level first
    pub fn level_deviations(&mut self, frame: &[f64]) -> Vec<f64> {
        // Trailing zero padding carries no noise
        let active = frame.iter().rposition(|&x| x != 0.0).map_or(0, |last| last + 1);
        let active = active + active % 2;

        self.approximation.clear();
        self.approximation.extend_from_slice(&frame[..active.min(frame.len())]);
        self.approximation.resize(active, 0.0);

        let mut deviations = Vec::new();
        let mut last_sigma = 0.0;
        while self.approximation.len() >= 2 {
            let pairs = self.approximation.len() / 2;
            self.details.clear();
            for i in 0..pairs {
                let (a, b) = (self.approximation[2 * i], self.approximation[2 * i + 1]);
                self.details.push(((a - b) / std::f64::consts::SQRT_2).abs());
                self.approximation[i] = (a + b) / std::f64::consts::SQRT_2;
            }
            self.approximation.truncate(pairs);

            if pairs >= WAVELET_MIN_COEFFICIENTS || deviations.is_empty() {
                last_sigma = median_in_place(&mut self.details) / MAD_TO_SIGMA;
            }
            deviations.push(last_sigma);
        }
        deviations
    }
}

impl Default for WaveletEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseEstimator for WaveletEstimator {
    fn update(&mut self, _spectrum: &[Complex64], frame: &[f64]) -> bool {
        let active = frame.iter().rposition(|&x| x != 0.0).map_or(0, |last| last + 1);
        if active == 0 || self.noise_power.is_empty() {
            return false;
        }

        let deviations = self.level_deviations(frame);
        let coarsest = deviations.last().copied().unwrap_or(0.0);
        let a = if self.frames_seen == 0 { 0.0 } else { self.smoothing };
        let half = self.transform_size / 2;

        for (k, noise) in self.noise_power.iter_mut().enumerate() {
            // Level j (0 = finest) spans bins [half / 2^(j+1), half / 2^j]
            let level = if k == 0 {
                deviations.len().saturating_sub(1)
            } else {
                (half / k).ilog2() as usize
            };
            let sigma = deviations.get(level).copied().unwrap_or(coarsest);
            let instant = active as f64 * sigma * sigma;
            *noise = a * *noise + (1.0 - a) * instant;
        }

        self.frames_seen += 1;
        true
    }

    fn noise_power(&self) -> &[f64] {
        &self.noise_power
    }

    fn on_transform_size_changed(&mut self, geometry: &TransformGeometry) {
        self.transform_size = geometry.transform_size;
        self.noise_power = vec![0.0; geometry.spectrum_size];
        self.approximation = Vec::with_capacity(geometry.transform_size);
        self.details = Vec::with_capacity(geometry.transform_size / 2);
        self.frames_seen = 0;
    }

    fn on_input_data_changed(&mut self) {
        self.noise_power.fill(0.0);
        self.frames_seen = 0;
    }

    fn algorithm(&self) -> EstimationAlgorithm {
        EstimationAlgorithm::Wavelet
    }
}

// ============================================================================
// Tests
// ============================================================================
