//! Frame-based spectral subtraction noise reduction
//!
//! The crate removes an estimated noise power spectrum from a signal frame by
//! frame while keeping the phase of every bin. A [`TransformContext`] owns the
//! signal, the transform and the framing policy, and drives two pluggable
//! strategies over it:
//!
//! - a [`NoiseEstimator`] (Simple, Martin minimum statistics, Wavelet)
//! - a [`Subtraction`] (Standard, Equal-Loudness, Geometric, Bypass)
//!
//! ```no_run
//! use noisered::{SubtractionParameters, TransformContext, ContourDirectory};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut context = TransformContext::new(512, 16000)?;
//! let parameters: SubtractionParameters = "2.0 0.02 0.05 0.0005 1 martin el".parse()?;
//! parameters.apply(&mut context, Arc::new(ContourDirectory::new("60phon")))?;
//!
//! context.read_pcm_file("noisy.raw")?;
//! context.process()?;
//! context.write_pcm_file("clean.raw")?;
//! # Ok(())
//! # }
//! ```

/// Numeric helpers
pub mod utils;
/// Real-input FFT
pub mod fft_processor;
/// Equal-loudness contour tables
pub mod loudness;
/// Noise power estimators
pub mod noise_estimation;
/// Spectral subtraction algorithms
pub mod spectral_subtraction;
/// Transform context and processing driver
pub mod context;
/// PCM and WAV ingestion and egress
pub mod pcm;
/// Subtraction parameter files
pub mod config;

#[cfg(feature = "wasm")]
pub mod wasm;

pub use config::{ConfigError, SubtractionParameters};
pub use context::{
    ContextError, DataSource, FrameCursor, FramingMode, TransformContext, TransformContextBuilder,
};
pub use fft_processor::{RealFftProcessor, TransformError, TransformGeometry};
pub use loudness::{ContourDirectory, ContourSource, InMemoryContours, LoudnessContourTable, LoudnessError};
pub use noise_estimation::{
    shared_estimator, EstimationAlgorithm, MartinEstimator, NoiseEstimator, SharedEstimator,
    SimpleEstimator, WaveletEstimator,
};
pub use pcm::PcmError;
pub use spectral_subtraction::{
    shared_subtraction, BypassSubtraction, Coefficients, EqualLoudnessSubtraction,
    GeometricSubtraction, SharedSubtraction, StandardSubtraction, Subtraction,
    SubtractionAlgorithm, SubtractionError,
};
