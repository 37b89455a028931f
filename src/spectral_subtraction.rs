//! Spectral subtraction for noise reduction
//!
//! Every variant rewrites the magnitude of each non-redundant bin from the
//! bin's power and the current noise power estimate, and leaves its phase
//! untouched. Magnitudes are changed by multiplying the complex bin with a
//! non-negative real gain, so the phase never has to be extracted.
//!
//! The power-domain variants share one rule:
//!
//! ```text
//! power     = |X[k]|^2
//! magnitude = sqrt(max(power - alpha_k * noise[k], beta_k * power))
//! ```
//!
//! The floor `beta_k * power` keeps the radicand non-negative and bounds the
//! attenuation of any bin, which is what suppresses musical noise.

use crate::fft_processor::TransformGeometry;
use crate::loudness::{ContourSource, LoudnessContourTable, LoudnessError};
use crate::utils::{bin_power, clamp_coefficient, LOUDNESS_REFERENCE_PHON};
use num_complex::Complex64;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Default over-subtraction factor
pub const DEFAULT_ALPHA: f64 = 2.0;

/// Default spectral floor, roughly -34 dB
pub const DEFAULT_BETA: f64 = 0.02;

/// Default over-subtraction change per phon above the reference contour
pub const DEFAULT_ALPHA_WEIGHT: f64 = 0.05;

/// Default spectral floor change per phon above the reference contour
pub const DEFAULT_BETA_WEIGHT: f64 = 0.0005;

/// Decision-directed smoothing of the a-priori SNR
pub const GEOMETRIC_SMOOTHING: f64 = 0.98;

/// A-posteriori SNR ceiling, avoids overflow in the gain expression
pub const GEOMETRIC_MAX_SNR: f64 = 40.0;

/// A-priori SNR floor (-25 dB)
pub const GEOMETRIC_MIN_PRIORI_SNR: f64 = 0.003_162_277_660_168_379_4;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubtractionError {
    #[error("Loudness contour unavailable: {0}")]
    Contour(#[from] LoudnessError),

    #[error("Spectrum has {spectrum} bins but the noise estimate has {noise}")]
    LengthMismatch { spectrum: usize, noise: usize },

    #[error("No loudness contour loaded; the transform size was never set")]
    NotPrepared,
}

pub type Result<T> = std::result::Result<T, SubtractionError>;

// ============================================================================
// Strategy Interface
// ============================================================================

/// Available subtraction algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtractionAlgorithm {
    Standard,
    EqualLoudness,
    Geometric,
    Bypass,
}

impl SubtractionAlgorithm {
    /// Token used in parameter files
    pub fn token(&self) -> &'static str {
        match self {
            SubtractionAlgorithm::Standard => "std",
            SubtractionAlgorithm::EqualLoudness => "el",
            SubtractionAlgorithm::Geometric => "ga",
            SubtractionAlgorithm::Bypass => "bypass",
        }
    }
}

impl fmt::Display for SubtractionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for SubtractionAlgorithm {
    type Err = String;

    fn from_str(token: &str) -> std::result::Result<Self, Self::Err> {
        match token {
            "std" => Ok(SubtractionAlgorithm::Standard),
            "el" => Ok(SubtractionAlgorithm::EqualLoudness),
            "ga" => Ok(SubtractionAlgorithm::Geometric),
            "bypass" => Ok(SubtractionAlgorithm::Bypass),
            other => Err(format!("unknown subtraction algorithm '{}'", other)),
        }
    }
}

/// Rewrites spectrum magnitudes in place given a noise power estimate
pub trait Subtraction {
    /// Process the `spectrum_size` bins of one frame
    fn apply(&mut self, spectrum: &mut [Complex64], noise_power: &[f64]) -> Result<()>;

    /// Rebuild per-size state
    fn on_transform_size_changed(&mut self, geometry: &TransformGeometry) -> Result<()>;

    /// New input data was loaded
    fn on_input_data_changed(&mut self);

    fn algorithm(&self) -> SubtractionAlgorithm;
}

/// Subtraction handle shared between the context and whoever configured it
pub type SharedSubtraction = Rc<RefCell<dyn Subtraction>>;

/// Wrap a subtraction into a shared handle
pub fn shared_subtraction<S: Subtraction + 'static>(subtraction: S) -> SharedSubtraction {
    Rc::new(RefCell::new(subtraction))
}

fn check_lengths(spectrum: &[Complex64], noise_power: &[f64]) -> Result<()> {
    if spectrum.len() != noise_power.len() {
        return Err(SubtractionError::LengthMismatch {
            spectrum: spectrum.len(),
            noise: noise_power.len(),
        });
    }
    Ok(())
}

/// Apply the floored power subtraction to one bin
#[inline]
fn subtract_with_floor(bin: &mut Complex64, noise: f64, alpha: f64, beta: f64) {
    let power = bin_power(*bin);
    if power <= 0.0 {
        return;
    }

    // `max` also discards a NaN noise value
    let magnitude = (power - alpha * noise).max(beta * power).sqrt();
    *bin *= magnitude / power.sqrt();
}

// ============================================================================
// Coefficients
// ============================================================================

/// Over-subtraction factor and spectral floor, both kept strictly positive
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    alpha: f64,
    beta: f64,
}

impl Coefficients {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha: clamp_coefficient(alpha),
            beta: clamp_coefficient(beta),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Set the over-subtraction factor, clamped to `COEFFICIENT_EPSILON`
    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = clamp_coefficient(alpha);
    }

    /// Set the spectral floor, clamped to `COEFFICIENT_EPSILON`
    pub fn set_beta(&mut self, beta: f64) {
        self.beta = clamp_coefficient(beta);
    }
}

impl Default for Coefficients {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA, DEFAULT_BETA)
    }
}

// ============================================================================
// Standard Subtraction
// ============================================================================

/// Constant over-subtraction and floor for every bin
#[derive(Debug, Clone, Default)]
pub struct StandardSubtraction {
    coefficients: Coefficients,
}

impl StandardSubtraction {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            coefficients: Coefficients::new(alpha, beta),
        }
    }

    pub fn coefficients(&self) -> &Coefficients {
        &self.coefficients
    }

    pub fn coefficients_mut(&mut self) -> &mut Coefficients {
        &mut self.coefficients
    }
}

impl Subtraction for StandardSubtraction {
    fn apply(&mut self, spectrum: &mut [Complex64], noise_power: &[f64]) -> Result<()> {
        check_lengths(spectrum, noise_power)?;

        let (alpha, beta) = (self.coefficients.alpha, self.coefficients.beta);
        for (bin, &noise) in spectrum.iter_mut().zip(noise_power) {
            subtract_with_floor(bin, noise, alpha, beta);
        }
        Ok(())
    }

    fn on_transform_size_changed(&mut self, _geometry: &TransformGeometry) -> Result<()> {
        Ok(())
    }

    fn on_input_data_changed(&mut self) {}

    fn algorithm(&self) -> SubtractionAlgorithm {
        SubtractionAlgorithm::Standard
    }
}

// ============================================================================
// Equal-Loudness Subtraction
// ============================================================================

/// Subtraction weighted per bin by an equal-loudness contour
///
/// Bins that are louder than the 60 phon reference get a smaller
/// over-subtraction factor and floor:
///
/// ```text
/// alpha_k = alpha - alpha_weight * (L[k] - 60)
/// beta_k  = beta  - beta_weight  * (L[k] - 60)
/// ```
///
/// `beta_k` is clamped to `COEFFICIENT_EPSILON` before use. The contour holds
/// `transform_size / 2` entries, the Nyquist bin shares the last one.
pub struct EqualLoudnessSubtraction {
    coefficients: Coefficients,
    alpha_weight: f64,
    beta_weight: f64,
    contours: LoudnessContourTable,
    contour: Option<Arc<[f64]>>,
}

impl EqualLoudnessSubtraction {
    pub fn new(contours: LoudnessContourTable) -> Self {
        Self {
            coefficients: Coefficients::default(),
            alpha_weight: DEFAULT_ALPHA_WEIGHT,
            beta_weight: DEFAULT_BETA_WEIGHT,
            contours,
            contour: None,
        }
    }

    /// Create with its own contour cache over `source`
    pub fn from_source(source: Arc<dyn ContourSource>) -> Self {
        Self::new(LoudnessContourTable::new(source))
    }

    pub fn coefficients(&self) -> &Coefficients {
        &self.coefficients
    }

    pub fn coefficients_mut(&mut self) -> &mut Coefficients {
        &mut self.coefficients
    }

    pub fn alpha_weight(&self) -> f64 {
        self.alpha_weight
    }

    pub fn set_alpha_weight(&mut self, value: f64) {
        self.alpha_weight = clamp_coefficient(value);
    }

    pub fn beta_weight(&self) -> f64 {
        self.beta_weight
    }

    pub fn set_beta_weight(&mut self, value: f64) {
        self.beta_weight = clamp_coefficient(value);
    }

    /// Contour currently in use
    pub fn contour(&self) -> Option<&[f64]> {
        self.contour.as_deref()
    }

    /// Effective `(alpha_k, beta_k)` of one bin
    ///
    /// `beta_k = beta - beta_weight * (L_k - 60)` is clamped to
    /// [`COEFFICIENT_EPSILON`](crate::utils::COEFFICIENT_EPSILON), so loud
    /// bins keep a positive floor instead of the raw weighted value.
    /// `alpha_k` is not clamped. Bins past the contour reuse its last entry.
    pub fn bin_coefficients(&self, bin: usize) -> Option<(f64, f64)> {
        let contour = self.contour.as_deref()?;
        let loudness = contour.get(bin).or_else(|| contour.last())?;
        let excess = loudness - LOUDNESS_REFERENCE_PHON;

        Some((
            self.coefficients.alpha - self.alpha_weight * excess,
            clamp_coefficient(self.coefficients.beta - self.beta_weight * excess),
        ))
    }
}

impl Subtraction for EqualLoudnessSubtraction {
    fn apply(&mut self, spectrum: &mut [Complex64], noise_power: &[f64]) -> Result<()> {
        check_lengths(spectrum, noise_power)?;
        if self.contour.is_none() {
            return Err(SubtractionError::NotPrepared);
        }

        for (k, (bin, &noise)) in spectrum.iter_mut().zip(noise_power).enumerate() {
            if let Some((alpha, beta)) = self.bin_coefficients(k) {
                subtract_with_floor(bin, noise, alpha, beta);
            }
        }
        Ok(())
    }

    fn on_transform_size_changed(&mut self, geometry: &TransformGeometry) -> Result<()> {
        self.contour = None;
        let contour = self.contours.contour(geometry.transform_size)?;
        log::debug!(
            "Equal-loudness subtraction using {}-entry contour for transform size {}",
            contour.len(),
            geometry.transform_size
        );
        self.contour = Some(contour);
        Ok(())
    }

    fn on_input_data_changed(&mut self) {}

    fn algorithm(&self) -> SubtractionAlgorithm {
        SubtractionAlgorithm::EqualLoudness
    }
}

// ============================================================================
// Geometric Subtraction
// ============================================================================

/// Geometric approach to spectral subtraction (Lu & Loizou, 2008)
///
/// The gain comes from the triangle formed by the noisy, clean and noise
/// phasors. It depends on the a-posteriori SNR `gamma` and a
/// decision-directed a-priori SNR `xi`:
///
/// ```text
/// H = sqrt((1 - (gamma - xi + 1)^2 / (4 gamma)) / (1 - (gamma - xi - 1)^2 / (4 xi)))
/// ```
///
/// clamped to [0, 1]. Bins without a noise estimate pass unchanged.
#[derive(Debug, Clone, Default)]
pub struct GeometricSubtraction {
    previous_clean_power: Vec<f64>,
    primed: bool,
}

impl GeometricSubtraction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gain for one bin given both SNRs
    pub fn gain(gamma: f64, xi: f64) -> f64 {
        let numerator = 1.0 - (gamma - xi + 1.0).powi(2) / (4.0 * gamma);
        let denominator = 1.0 - (gamma - xi - 1.0).powi(2) / (4.0 * xi);
        let gain = (numerator / denominator).sqrt();

        if gain.is_finite() {
            gain.clamp(0.0, 1.0)
        } else {
            1.0
        }
    }
}

impl Subtraction for GeometricSubtraction {
    fn apply(&mut self, spectrum: &mut [Complex64], noise_power: &[f64]) -> Result<()> {
        check_lengths(spectrum, noise_power)?;
        if self.previous_clean_power.len() != spectrum.len() {
            self.previous_clean_power = vec![0.0; spectrum.len()];
            self.primed = false;
        }

        let a = GEOMETRIC_SMOOTHING;
        for (k, (bin, &noise)) in spectrum.iter_mut().zip(noise_power).enumerate() {
            let power = bin_power(*bin);
            if noise <= 0.0 || power <= 0.0 || noise.is_nan() {
                self.previous_clean_power[k] = power;
                continue;
            }

            let gamma = (power / noise).min(GEOMETRIC_MAX_SNR);
            let xi = if self.primed {
                a * self.previous_clean_power[k] / noise + (1.0 - a) * (gamma - 1.0).max(0.0)
            } else {
                a + (1.0 - a) * (gamma - 1.0).max(0.0)
            };
            let xi = xi.max(GEOMETRIC_MIN_PRIORI_SNR);

            let gain = Self::gain(gamma, xi);
            *bin *= gain;
            self.previous_clean_power[k] = gain * gain * power;
        }

        self.primed = true;
        Ok(())
    }

    fn on_transform_size_changed(&mut self, geometry: &TransformGeometry) -> Result<()> {
        self.previous_clean_power = vec![0.0; geometry.spectrum_size];
        self.primed = false;
        Ok(())
    }

    fn on_input_data_changed(&mut self) {
        self.previous_clean_power.fill(0.0);
        self.primed = false;
    }

    fn algorithm(&self) -> SubtractionAlgorithm {
        SubtractionAlgorithm::Geometric
    }
}

// ============================================================================
// Bypass
// ============================================================================

/// Leaves the spectrum unmodified
#[derive(Debug, Clone, Copy, Default)]
pub struct BypassSubtraction;

impl Subtraction for BypassSubtraction {
    fn apply(&mut self, _spectrum: &mut [Complex64], _noise_power: &[f64]) -> Result<()> {
        Ok(())
    }

    fn on_transform_size_changed(&mut self, _geometry: &TransformGeometry) -> Result<()> {
        Ok(())
    }

    fn on_input_data_changed(&mut self) {}

    fn algorithm(&self) -> SubtractionAlgorithm {
        SubtractionAlgorithm::Bypass
    }
}

// ============================================================================
// Tests
// ============================================================================
