//! Transform context: buffers, framing and the processing driver
//!
//! The context owns the working signal, the transform plans and the scratch
//! buffers of one denoising session, and drives the attached noise estimator
//! and subtraction over the signal frame by frame.
//!
//! # Framing
//!
//! - [`FramingMode::Direct`]: frames of `N` samples follow each other without
//!   overlap, every processed frame overwrites its region.
//! - [`FramingMode::OverlapAdd`]: frames advance by `N/2`. Each frame reads
//!   `N/2` samples, zero-pads them to `N`, and its `N` output samples are
//!   added into the working signal. Consecutive frames overlap by `N/2`.
//!
//! Frames read the working signal in place. In overlap-add mode the region a
//! frame reads still holds the tail the previous frame accumulated there, so
//! that tail goes through this frame's subtraction too. The region is cleared
//! once read, and a [`FrameCursor`] makes sure no region is read twice within
//! a pass.
//!
//! # Thread Safety
//! The context shares its strategies through `Rc<RefCell<_>>` and is
//! neither `Send` nor `Sync`.

use crate::fft_processor::{
    validate_transform_size, RealFftProcessor, TransformError, TransformGeometry,
};
use crate::noise_estimation::{shared_estimator, SharedEstimator, SimpleEstimator};
use crate::spectral_subtraction::{
    shared_subtraction, SharedSubtraction, StandardSubtraction, SubtractionError,
};
use num_complex::Complex64;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Default transform size
pub const DEFAULT_TRANSFORM_SIZE: usize = 512;

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Default number of passes over the signal
pub const DEFAULT_ITERATIONS: usize = 1;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Invalid sample rate: {rate}")]
    InvalidSampleRate { rate: u32 },

    #[error("Samples {start}..{end} were already consumed in this pass (cursor at {consumed})")]
    RegionConsumed { start: usize, end: usize, consumed: usize },

    #[error("Frame position {position} is outside the {len} loaded samples")]
    PositionOutOfRange { position: usize, len: usize },

    #[error(transparent)]
    Subtraction(#[from] SubtractionError),
}

pub type Result<T> = std::result::Result<T, ContextError>;

// ============================================================================
// Framing
// ============================================================================

/// How frames are cut from the signal and written back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    #[default]
    Direct,
    OverlapAdd,
}

/// Origin of the loaded samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSource {
    #[default]
    None,
    Buffer,
    File,
}

/// Consumed prefix of the working signal in overlap-add mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCursor {
    consumed: usize,
}

impl FrameCursor {
    /// End of the consumed region
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Mark `start..end` as consumed; fails if part of it already is
    pub fn claim(&mut self, start: usize, end: usize) -> Result<()> {
        if start < self.consumed {
            return Err(ContextError::RegionConsumed {
                start,
                end,
                consumed: self.consumed,
            });
        }
        self.consumed = end;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.consumed = 0;
    }
}

// ============================================================================
// Transform Context
// ============================================================================

/// Transform state and working signal of one denoising session
pub struct TransformContext {
    geometry: TransformGeometry,
    framing: FramingMode,
    fft: RealFftProcessor,

    // Transform-domain scratch, sized by the geometry
    input_buffer: Vec<f64>,
    output_buffer: Vec<f64>,
    spectrum: Vec<Complex64>,
    noise_scratch: Vec<f64>,

    sample_data: Vec<f64>,
    original_data: Vec<f64>,
    data_source: DataSource,

    // Pass state
    cursor: FrameCursor,
    pass_open: bool,

    iterations: usize,
    bypass: bool,

    estimator: SharedEstimator,
    subtractor: SharedSubtraction,
}

impl TransformContext {
    /// Create a context with a Simple estimator and Standard subtraction
    pub fn new(transform_size: usize, sample_rate: u32) -> Result<Self> {
        validate_transform_size(transform_size)?;
        validate_sample_rate(sample_rate)?;

        let geometry = TransformGeometry::new(transform_size, sample_rate);
        let fft = RealFftProcessor::new(transform_size)?;

        let mut context = Self {
            geometry,
            framing: FramingMode::default(),
            fft,
            input_buffer: vec![0.0; transform_size],
            output_buffer: vec![0.0; transform_size],
            spectrum: vec![Complex64::new(0.0, 0.0); geometry.spectrum_size],
            noise_scratch: Vec::with_capacity(geometry.spectrum_size),
            sample_data: Vec::new(),
            original_data: Vec::new(),
            data_source: DataSource::None,
            cursor: FrameCursor::default(),
            pass_open: false,
            iterations: DEFAULT_ITERATIONS,
            bypass: false,
            estimator: shared_estimator(SimpleEstimator::new()),
            subtractor: shared_subtraction(StandardSubtraction::default()),
        };
        context.notify_size_changed()?;
        Ok(context)
    }

    /// Start a builder
    pub fn builder() -> TransformContextBuilder {
        TransformContextBuilder::new()
    }

    // ------------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------------

    pub fn transform_size(&self) -> usize {
        self.geometry.transform_size
    }

    pub fn spectrum_size(&self) -> usize {
        self.geometry.spectrum_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.geometry.sample_rate
    }

    pub fn geometry(&self) -> TransformGeometry {
        self.geometry
    }

    /// Change the transform size
    ///
    /// Rebuilds plans and buffers, then notifies the estimator and the
    /// subtraction, in that order. Invalid sizes leave the context untouched.
    pub fn set_transform_size(&mut self, transform_size: usize) -> Result<()> {
        self.reconfigure(transform_size, self.geometry.sample_rate)
    }

    /// Change the sample rate; same rebuild and notification as a size change
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        self.reconfigure(self.geometry.transform_size, sample_rate)
    }

    fn reconfigure(&mut self, transform_size: usize, sample_rate: u32) -> Result<()> {
        validate_transform_size(transform_size)?;
        validate_sample_rate(sample_rate)?;

        let fft = RealFftProcessor::new(transform_size)?;
        self.geometry = TransformGeometry::new(transform_size, sample_rate);
        self.fft = fft;
        self.input_buffer = vec![0.0; transform_size];
        self.output_buffer = vec![0.0; transform_size];
        self.spectrum = vec![Complex64::new(0.0, 0.0); self.geometry.spectrum_size];
        self.pass_open = false;

        log::debug!(
            "Transform reconfigured: size {}, {} bins, {} Hz",
            transform_size,
            self.geometry.spectrum_size,
            sample_rate
        );
        self.notify_size_changed()
    }

    fn notify_size_changed(&mut self) -> Result<()> {
        self.estimator
            .borrow_mut()
            .on_transform_size_changed(&self.geometry);
        self.subtractor
            .borrow_mut()
            .on_transform_size_changed(&self.geometry)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Framing and options
    // ------------------------------------------------------------------------

    pub fn framing(&self) -> FramingMode {
        self.framing
    }

    pub fn set_framing(&mut self, framing: FramingMode) {
        self.framing = framing;
        self.pass_open = false;
    }

    /// Distance between consecutive frame positions
    pub fn frame_increment(&self) -> usize {
        match self.framing {
            FramingMode::Direct => self.geometry.transform_size,
            FramingMode::OverlapAdd => self.geometry.transform_size / 2,
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Set the number of passes, at least one
    pub fn set_iterations(&mut self, iterations: usize) {
        self.iterations = iterations.max(1);
    }

    pub fn bypass(&self) -> bool {
        self.bypass
    }

    /// When set, `process` leaves the signal untouched
    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    // ------------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------------

    pub fn estimator(&self) -> &SharedEstimator {
        &self.estimator
    }

    /// Attach a noise estimator and size it to the current geometry
    pub fn set_estimator(&mut self, estimator: SharedEstimator) {
        estimator
            .borrow_mut()
            .on_transform_size_changed(&self.geometry);
        log::debug!("Attached {} noise estimator", estimator.borrow().algorithm());
        self.estimator = estimator;
    }

    pub fn subtractor(&self) -> &SharedSubtraction {
        &self.subtractor
    }

    /// Attach a subtraction and size it to the current geometry
    ///
    /// A subtraction that cannot prepare itself for the current transform
    /// size is not attached and the previous one stays in place.
    pub fn set_subtractor(&mut self, subtractor: SharedSubtraction) -> Result<()> {
        subtractor
            .borrow_mut()
            .on_transform_size_changed(&self.geometry)?;
        log::debug!("Attached {} subtraction", subtractor.borrow().algorithm());
        self.subtractor = subtractor;
        Ok(())
    }

    fn notify_data_changed(&mut self) {
        self.estimator.borrow_mut().on_input_data_changed();
        self.subtractor.borrow_mut().on_input_data_changed();
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Replace the signal with normalized samples held in memory
    pub fn load_samples(&mut self, samples: &[f64]) {
        self.replace_samples(samples.to_vec(), DataSource::Buffer);
    }

    /// Replace the signal, recording where it came from
    pub fn replace_samples(&mut self, samples: Vec<f64>, source: DataSource) {
        self.sample_data = samples.clone();
        self.original_data = samples;
        self.data_source = source;
        self.cursor.reset();
        self.pass_open = false;

        log::debug!("Loaded {} samples from {:?}", self.original_data.len(), source);
        self.notify_data_changed();
    }

    /// Working signal, processed in place
    pub fn sample_data(&self) -> &[f64] {
        &self.sample_data
    }

    /// Signal as loaded
    pub fn original_data(&self) -> &[f64] {
        &self.original_data
    }

    pub fn len(&self) -> usize {
        self.sample_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_data.is_empty()
    }

    pub fn data_source(&self) -> DataSource {
        self.data_source
    }

    pub fn spectrum(&self) -> &[Complex64] {
        &self.spectrum
    }

    pub fn spectrum_mut(&mut self) -> &mut [Complex64] {
        &mut self.spectrum
    }

    pub fn input_buffer(&self) -> &[f64] {
        &self.input_buffer
    }

    pub fn output_buffer(&self) -> &[f64] {
        &self.output_buffer
    }

    /// Consumed prefix of the current pass
    pub fn cursor(&self) -> FrameCursor {
        self.cursor
    }

    // ------------------------------------------------------------------------
    // Frame steps
    // ------------------------------------------------------------------------

    /// Start a new pass over the working signal
    ///
    /// Frame steps start a pass on their own when none is open.
    pub fn begin_pass(&mut self) {
        self.cursor.reset();
        self.pass_open = true;
    }

    fn ensure_pass(&mut self) {
        if !self.pass_open {
            self.begin_pass();
        }
    }

    fn check_position(&self, position: usize) -> Result<()> {
        if position >= self.sample_data.len() {
            return Err(ContextError::PositionOutOfRange {
                position,
                len: self.sample_data.len(),
            });
        }
        Ok(())
    }

    /// Fill the input buffer with the frame starting at `position`
    ///
    /// Samples past the end of the signal read as zero. In overlap-add mode
    /// only `N/2` samples are read, then cleared from the working signal and
    /// marked consumed.
    pub fn copy_input_frame(&mut self, position: usize) -> Result<()> {
        self.check_position(position)?;
        self.ensure_pass();

        let len = self.sample_data.len();
        let end = match self.framing {
            FramingMode::Direct => (position + self.geometry.transform_size).min(len),
            FramingMode::OverlapAdd => {
                let end = (position + self.frame_increment()).min(len);
                self.cursor.claim(position, end)?;
                end
            }
        };

        let count = end - position;
        let source = &mut self.sample_data[position..end];
        self.input_buffer[..count].copy_from_slice(source);
        self.input_buffer[count..].fill(0.0);
        if self.framing == FramingMode::OverlapAdd {
            source.fill(0.0);
        }
        Ok(())
    }

    /// Write the normalized output buffer back at `position`
    ///
    /// Direct framing overwrites, overlap-add accumulates. Output past the
    /// end of the signal is dropped.
    pub fn write_output_frame(&mut self, position: usize) -> Result<()> {
        self.check_position(position)?;
        self.ensure_pass();

        let scale = 1.0 / self.geometry.transform_size as f64;
        let end = (position + self.geometry.transform_size).min(self.sample_data.len());
        let target = &mut self.sample_data[position..end];

        match self.framing {
            FramingMode::Direct => {
                for (sample, &out) in target.iter_mut().zip(&self.output_buffer) {
                    *sample = out * scale;
                }
            }
            FramingMode::OverlapAdd => {
                for (sample, &out) in target.iter_mut().zip(&self.output_buffer) {
                    *sample += out * scale;
                }
            }
        }
        Ok(())
    }

    /// Input buffer to spectrum
    pub fn run_forward(&mut self) -> Result<()> {
        self.fft.forward(&self.input_buffer, &mut self.spectrum)?;
        Ok(())
    }

    /// Spectrum to output buffer, unnormalized
    pub fn run_backward(&mut self) -> Result<()> {
        self.fft.inverse(&self.spectrum, &mut self.output_buffer)?;
        Ok(())
    }

    fn estimate_and_subtract(&mut self) -> Result<()> {
        {
            let mut estimator = self.estimator.borrow_mut();
            estimator.update(&self.spectrum, &self.input_buffer);
            self.noise_scratch.clear();
            self.noise_scratch.extend_from_slice(estimator.noise_power());
        }

        self.subtractor
            .borrow_mut()
            .apply(&mut self.spectrum, &self.noise_scratch)?;
        Ok(())
    }

    /// Run the whole pipeline on the frame at `position`
    ///
    /// # Panics
    /// If the estimator or subtraction is mutably borrowed elsewhere.
    pub fn process_frame(&mut self, position: usize) -> Result<()> {
        self.copy_input_frame(position)?;
        self.run_forward()?;
        self.estimate_and_subtract()?;
        self.run_backward()?;
        self.write_output_frame(position)
    }

    /// Denoise the loaded signal
    ///
    /// Restarts from the original samples, notifies the strategies, then
    /// runs `iterations` passes over the signal. Does nothing in bypass.
    pub fn process(&mut self) -> Result<()> {
        if self.bypass {
            log::debug!("Bypass set, leaving {} samples untouched", self.len());
            return Ok(());
        }

        self.sample_data.copy_from_slice(&self.original_data);
        self.notify_data_changed();

        let increment = self.frame_increment();
        for iteration in 0..self.iterations {
            self.begin_pass();

            let mut frames = 0;
            let mut position = 0;
            while position < self.sample_data.len() {
                self.process_frame(position)?;
                position += increment;
                frames += 1;
            }

            log::trace!(
                "Pass {}/{}: {} frames of {} samples",
                iteration + 1,
                self.iterations,
                frames,
                self.geometry.transform_size
            );
        }

        self.pass_open = false;
        Ok(())
    }
}

fn validate_sample_rate(sample_rate: u32) -> Result<()> {
    if sample_rate == 0 {
        return Err(ContextError::InvalidSampleRate { rate: sample_rate });
    }
    Ok(())
}

// ============================================================================
// Builder Pattern
// ============================================================================

/// Builder for TransformContext
pub struct TransformContextBuilder {
    transform_size: usize,
    sample_rate: u32,
    framing: FramingMode,
    iterations: usize,
    bypass: bool,
    estimator: Option<SharedEstimator>,
    subtractor: Option<SharedSubtraction>,
}

impl TransformContextBuilder {
    pub fn new() -> Self {
        Self {
            transform_size: DEFAULT_TRANSFORM_SIZE,
            sample_rate: DEFAULT_SAMPLE_RATE,
            framing: FramingMode::default(),
            iterations: DEFAULT_ITERATIONS,
            bypass: false,
            estimator: None,
            subtractor: None,
        }
    }

    pub fn transform_size(mut self, size: usize) -> Self {
        self.transform_size = size;
        self
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    /// Shorthand for overlap-add framing
    pub fn overlap_add(self) -> Self {
        self.framing(FramingMode::OverlapAdd)
    }

    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn estimator(mut self, estimator: SharedEstimator) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn subtractor(mut self, subtractor: SharedSubtraction) -> Self {
        self.subtractor = Some(subtractor);
        self
    }

    /// Build the context
    pub fn build(self) -> Result<TransformContext> {
        let mut context = TransformContext::new(self.transform_size, self.sample_rate)?;
        context.set_framing(self.framing);
        context.set_iterations(self.iterations);
        context.set_bypass(self.bypass);

        if let Some(estimator) = self.estimator {
            context.set_estimator(estimator);
        }
        if let Some(subtractor) = self.subtractor {
            context.set_subtractor(subtractor)?;
        }
        Ok(context)
    }
}

impl Default for TransformContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loudness::InMemoryContours;
    use crate::noise_estimation::{EstimationAlgorithm, NoiseEstimator};
    use crate::spectral_subtraction::{
        BypassSubtraction, EqualLoudnessSubtraction, Subtraction, SubtractionAlgorithm,
    };
    use crate::utils::bin_power;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    type EventLog = Rc<RefCell<Vec<String>>>;

    struct RecordingEstimator {
        events: EventLog,
        noise: Vec<f64>,
        level: f64,
    }

    impl NoiseEstimator for RecordingEstimator {
        fn update(&mut self, _spectrum: &[Complex64], _frame: &[f64]) -> bool {
            false
        }

        fn noise_power(&self) -> &[f64] {
            &self.noise
        }

        fn on_transform_size_changed(&mut self, geometry: &TransformGeometry) {
            self.events
                .borrow_mut()
                .push(format!("estimator:size:{}", geometry.transform_size));
            self.noise = vec![self.level; geometry.spectrum_size];
        }

        fn on_input_data_changed(&mut self) {
            self.events.borrow_mut().push("estimator:data".to_string());
        }

        fn algorithm(&self) -> EstimationAlgorithm {
            EstimationAlgorithm::Simple
        }
    }

    struct RecordingSubtraction {
        events: EventLog,
        frames: usize,
    }

    impl Subtraction for RecordingSubtraction {
        fn apply(
            &mut self,
            _spectrum: &mut [Complex64],
            _noise_power: &[f64],
        ) -> std::result::Result<(), SubtractionError> {
            self.frames += 1;
            Ok(())
        }

        fn on_transform_size_changed(
            &mut self,
            geometry: &TransformGeometry,
        ) -> std::result::Result<(), SubtractionError> {
            self.events
                .borrow_mut()
                .push(format!("subtraction:size:{}", geometry.transform_size));
            Ok(())
        }

        fn on_input_data_changed(&mut self) {
            self.events.borrow_mut().push("subtraction:data".to_string());
        }

        fn algorithm(&self) -> SubtractionAlgorithm {
            SubtractionAlgorithm::Bypass
        }
    }

    fn recording_context(transform_size: usize) -> (TransformContext, EventLog, Rc<RefCell<RecordingSubtraction>>) {
        let events: EventLog = Rc::new(RefCell::new(Vec::new()));
        let subtraction = Rc::new(RefCell::new(RecordingSubtraction {
            events: events.clone(),
            frames: 0,
        }));

        let mut context = TransformContext::new(transform_size, 16000).unwrap();
        context.set_estimator(shared_estimator(RecordingEstimator {
            events: events.clone(),
            noise: Vec::new(),
            level: 0.0,
        }));
        context.set_subtractor(subtraction.clone()).unwrap();
        events.borrow_mut().clear();
        (context, events, subtraction)
    }

    fn noisy_signal(len: usize, seed: u64) -> Vec<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..len)
            .map(|i| 0.4 * (i as f64 * 0.21).sin() + rng.gen_range(-0.05..0.05))
            .collect()
    }

    fn bypass_context(transform_size: usize, framing: FramingMode) -> TransformContext {
        TransformContext::builder()
            .transform_size(transform_size)
            .framing(framing)
            .subtractor(shared_subtraction(BypassSubtraction))
            .build()
            .unwrap()
    }

    #[test]
    fn test_context_creation() {
        let context = TransformContext::new(256, 16000).unwrap();
        assert_eq!(context.transform_size(), 256);
        assert_eq!(context.spectrum_size(), 129);
        assert_eq!(context.spectrum().len(), 129);
        assert_eq!(context.frame_increment(), 256);
        assert_eq!(context.data_source(), DataSource::None);
        assert!(context.is_empty());
        assert_eq!(context.estimator().borrow().noise_power().len(), 129);

        assert!(matches!(
            TransformContext::new(255, 16000),
            Err(ContextError::Transform(TransformError::InvalidSize { size: 255 }))
        ));
        assert!(TransformContext::new(0, 16000).is_err());
        assert_eq!(
            TransformContext::new(256, 0).err(),
            Some(ContextError::InvalidSampleRate { rate: 0 })
        );
    }

    #[test]
    fn test_frame_increment_follows_framing() {
        let mut context = TransformContext::new(64, 8000).unwrap();
        context.set_framing(FramingMode::OverlapAdd);
        assert_eq!(context.frame_increment(), 32);
        context.set_transform_size(128).unwrap();
        assert_eq!(context.frame_increment(), 64);
        context.set_framing(FramingMode::Direct);
        assert_eq!(context.frame_increment(), 128);
    }

    #[test]
    fn test_direct_round_trip_through_bypass() {
        let n = 64;
        let mut context = bypass_context(n, FramingMode::Direct);
        let signal = noisy_signal(3 * n + 17, 42);
        context.load_samples(&signal);
        context.process().unwrap();

        for (out, orig) in context.sample_data().iter().zip(signal.iter()) {
            assert_abs_diff_eq!(*out, *orig, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_overlap_add_reconstructs_signal() {
        let n = 32;
        let mut context = bypass_context(n, FramingMode::OverlapAdd);
        let signal = noisy_signal(5 * n / 2 + 3, 7);
        context.load_samples(&signal);
        context.process().unwrap();

        assert_eq!(context.len(), signal.len());
        for (out, orig) in context.sample_data().iter().zip(signal.iter()) {
            assert_abs_diff_eq!(*out, *orig, epsilon = 1e-12);
        }
        assert_eq!(context.original_data(), &signal[..]);
    }

    #[test]
    fn test_overlap_add_frames_accumulate() {
        let n = 8;
        let mut context = bypass_context(n, FramingMode::OverlapAdd);
        let signal: Vec<f64> = (1..=12).map(|i| i as f64 / 16.0).collect();
        context.load_samples(&signal);

        context.process_frame(0).unwrap();
        // First frame covers 0..4 and adds its zero tail onto the unread 4..8
        assert_abs_diff_eq!(context.sample_data()[3], signal[3], epsilon = 1e-12);
        assert_abs_diff_eq!(context.sample_data()[5], signal[5], epsilon = 1e-12);

        context.process_frame(4).unwrap();
        context.process_frame(8).unwrap();
        for (out, orig) in context.sample_data().iter().zip(signal.iter()) {
            assert_abs_diff_eq!(*out, *orig, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_overlap_add_input_copy_pads_and_consumes() {
        let n = 8;
        let mut context = bypass_context(n, FramingMode::OverlapAdd);
        context.load_samples(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);

        context.copy_input_frame(0).unwrap();
        assert_eq!(context.input_buffer(), &[0.1, 0.2, 0.3, 0.4, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(context.cursor().consumed(), 4);
        // Only the consumed region is cleared
        assert_eq!(context.sample_data(), &[0.0, 0.0, 0.0, 0.0, 0.5, 0.6]);

        assert_eq!(
            context.copy_input_frame(0),
            Err(ContextError::RegionConsumed { start: 0, end: 4, consumed: 4 })
        );

        context.copy_input_frame(4).unwrap();
        assert_eq!(context.input_buffer(), &[0.5, 0.6, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(context.copy_input_frame(2).is_err());

        // A new pass may read everything again
        context.begin_pass();
        assert!(context.copy_input_frame(0).is_ok());
    }

    /// Half-frame overlap-add over `data`, reading and clearing it in place
    fn in_place_overlap_add(data: &mut [f64], n: usize, noise: f64, passes: usize) {
        let half = n / 2;
        let mut fft = RealFftProcessor::new(n).unwrap();
        let mut subtraction = StandardSubtraction::new(2.0, 0.01);
        let noise = vec![noise; half + 1];
        let mut input = vec![0.0; n];
        let mut output = vec![0.0; n];
        let mut spectrum = vec![Complex64::new(0.0, 0.0); half + 1];

        for _ in 0..passes {
            let mut position = 0;
            while position < data.len() {
                let end = (position + half).min(data.len());
                input.fill(0.0);
                input[..end - position].copy_from_slice(&data[position..end]);
                data[position..end].fill(0.0);

                fft.forward(&input, &mut spectrum).unwrap();
                subtraction.apply(&mut spectrum, &noise).unwrap();
                fft.inverse(&spectrum, &mut output).unwrap();

                for (sample, &out) in data[position..].iter_mut().zip(&output) {
                    *sample += out / n as f64;
                }
                position += half;
            }
        }
    }

    #[test]
    fn test_overlap_add_tail_passes_through_next_frame() {
        let n = 16;
        let signal = noisy_signal(64 + 5, 21);

        for passes in [1, 2] {
            let mut context = TransformContext::builder()
                .transform_size(n)
                .overlap_add()
                .iterations(passes)
                .estimator(shared_estimator(RecordingEstimator {
                    events: Rc::new(RefCell::new(Vec::new())),
                    noise: Vec::new(),
                    level: 0.5,
                }))
                .subtractor(shared_subtraction(StandardSubtraction::new(2.0, 0.01)))
                .build()
                .unwrap();
            context.load_samples(&signal);
            context.process().unwrap();

            let mut expected = signal.clone();
            in_place_overlap_add(&mut expected, n, 0.5, passes);

            assert_eq!(context.len(), expected.len());
            for (out, reference) in context.sample_data().iter().zip(&expected) {
                assert_abs_diff_eq!(*out, *reference, epsilon = 1e-12);
            }
            // Subtraction leaks into the zero-padded half, so the result is not the input
            assert!(context
                .sample_data()
                .iter()
                .zip(&signal)
                .any(|(out, orig)| (out - orig).abs() > 1e-3));
        }
    }

    #[test]
    fn test_direct_input_copy_zero_pads() {
        let mut context = bypass_context(4, FramingMode::Direct);
        context.load_samples(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        context.copy_input_frame(4).unwrap();
        assert_eq!(context.input_buffer(), &[5.0, 6.0, 0.0, 0.0]);
        // Direct frames may be read repeatedly
        context.copy_input_frame(4).unwrap();

        assert_eq!(
            context.copy_input_frame(6),
            Err(ContextError::PositionOutOfRange { position: 6, len: 6 })
        );
        assert!(context.write_output_frame(9).is_err());
    }

    #[test]
    fn test_direct_output_overwrites_and_clips() {
        let mut context = bypass_context(4, FramingMode::Direct);
        context.load_samples(&[9.0; 6]);

        context.copy_input_frame(4).unwrap();
        context.run_forward().unwrap();
        context.run_backward().unwrap();
        assert_abs_diff_eq!(context.output_buffer()[0], 4.0 * 9.0, epsilon = 1e-12);

        context.write_output_frame(4).unwrap();
        assert_eq!(context.len(), 6);
        assert_abs_diff_eq!(context.sample_data()[4], 9.0, epsilon = 1e-12);
        assert_abs_diff_eq!(context.sample_data()[5], 9.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reconfiguration_notifies_once_in_order() {
        let (mut context, events, _) = recording_context(64);

        context.set_transform_size(128).unwrap();
        assert_eq!(context.spectrum_size(), 65);
        assert_eq!(context.spectrum().len(), 65);
        assert_eq!(context.input_buffer().len(), 128);
        assert_eq!(
            *events.borrow(),
            vec!["estimator:size:128".to_string(), "subtraction:size:128".to_string()]
        );

        events.borrow_mut().clear();
        context.set_sample_rate(22050).unwrap();
        assert_eq!(context.sample_rate(), 22050);
        assert_eq!(events.borrow().len(), 2);

        events.borrow_mut().clear();
        assert!(context.set_transform_size(100 + 1).is_err());
        assert!(context.set_sample_rate(0).is_err());
        assert!(events.borrow().is_empty());
        assert_eq!(context.transform_size(), 128);
        assert_eq!(context.sample_rate(), 22050);
    }

    #[test]
    fn test_frames_after_resize_use_new_size() {
        let (mut context, _, subtraction) = recording_context(64);
        context.load_samples(&noisy_signal(256, 1));

        context.process().unwrap();
        assert_eq!(subtraction.borrow().frames, 4);

        context.set_transform_size(32).unwrap();
        context.process().unwrap();
        assert_eq!(subtraction.borrow().frames, 4 + 8);
    }

    #[test]
    fn test_data_change_notifications() {
        let (mut context, events, _) = recording_context(16);

        context.load_samples(&[0.0; 20]);
        assert_eq!(
            *events.borrow(),
            vec!["estimator:data".to_string(), "subtraction:data".to_string()]
        );
        assert_eq!(context.data_source(), DataSource::Buffer);

        events.borrow_mut().clear();
        context.process().unwrap();
        assert_eq!(events.borrow().len(), 2);
    }

    #[test]
    fn test_failing_subtraction_is_not_attached() {
        let mut context = TransformContext::new(16, 16000).unwrap();
        let contours = InMemoryContours::new().with(32, vec![60.0; 16]);
        let equal_loudness = EqualLoudnessSubtraction::from_source(Arc::new(contours));

        let result = context.set_subtractor(shared_subtraction(equal_loudness));
        assert!(matches!(result, Err(ContextError::Subtraction(SubtractionError::Contour(_)))));
        assert_eq!(context.subtractor().borrow().algorithm(), SubtractionAlgorithm::Standard);
    }

    #[test]
    fn test_bypass_leaves_signal() {
        let mut context = TransformContext::builder()
            .transform_size(32)
            .bypass(true)
            .build()
            .unwrap();
        let signal = noisy_signal(100, 3);
        context.load_samples(&signal);
        context.process().unwrap();
        assert_eq!(context.sample_data(), &signal[..]);
        assert!(context.bypass());
    }

    #[test]
    fn test_empty_signal_processes() {
        let mut context = TransformContext::new(32, 16000).unwrap();
        context.load_samples(&[]);
        assert!(context.process().is_ok());
        assert!(context.is_empty());
    }

    #[test]
    fn test_iterations_clamped() {
        let mut context = TransformContext::new(32, 16000).unwrap();
        context.set_iterations(0);
        assert_eq!(context.iterations(), 1);
        context.set_iterations(4);
        assert_eq!(context.iterations(), 4);
    }

    #[test]
    fn test_more_iterations_suppress_more() {
        let n = 64;
        let signal = noisy_signal(n, 11);

        let magnitudes = |iterations: usize| -> Vec<f64> {
            let mut context = TransformContext::builder()
                .transform_size(n)
                .iterations(iterations)
                .estimator(shared_estimator(RecordingEstimator {
                    events: Rc::new(RefCell::new(Vec::new())),
                    noise: Vec::new(),
                    level: 0.5,
                }))
                .subtractor(shared_subtraction(StandardSubtraction::new(2.0, 0.01)))
                .build()
                .unwrap();
            context.load_samples(&signal);
            context.process().unwrap();

            let mut fft = RealFftProcessor::new(n).unwrap();
            let mut spectrum = vec![Complex64::new(0.0, 0.0); n / 2 + 1];
            fft.forward(context.sample_data(), &mut spectrum).unwrap();
            spectrum.iter().map(|&c| bin_power(c).sqrt()).collect()
        };

        let once = magnitudes(1);
        let twice = magnitudes(2);
        let thrice = magnitudes(3);
        for k in 0..=n / 2 {
            assert!(twice[k] <= once[k] * (1.0 + 1e-9) + 1e-12);
            assert!(thrice[k] <= twice[k] * (1.0 + 1e-9) + 1e-12);
        }
        assert!(thrice.iter().sum::<f64>() < once.iter().sum::<f64>());
    }

    #[test]
    fn test_builder_defaults() {
        let context = TransformContextBuilder::default().build().unwrap();
        assert_eq!(context.transform_size(), DEFAULT_TRANSFORM_SIZE);
        assert_eq!(context.sample_rate(), DEFAULT_SAMPLE_RATE);
        assert_eq!(context.framing(), FramingMode::Direct);
        assert_eq!(context.iterations(), 1);
        assert!(!context.bypass());

        let context = TransformContext::builder().overlap_add().build().unwrap();
        assert_eq!(context.frame_increment(), DEFAULT_TRANSFORM_SIZE / 2);
    }
}
