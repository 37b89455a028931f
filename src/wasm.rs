//! WebAssembly bindings
//!
//! A `Denoiser` owns one transform context and exposes whole-buffer
//! processing of 16-bit or float samples to JavaScript.

use crate::config::SubtractionParameters;
use crate::context::{FramingMode, TransformContext};
use crate::loudness::InMemoryContours;
use std::sync::Arc;
use wasm_bindgen::prelude::*;

fn to_js<E: std::fmt::Display>(err: E) -> JsValue {
    JsValue::from_str(&err.to_string())
}

/// WebAssembly-compatible noise reduction processor
#[wasm_bindgen]
pub struct Denoiser {
    context: TransformContext,
    contours: InMemoryContours,
}

#[wasm_bindgen]
impl Denoiser {
    #[wasm_bindgen(constructor)]
    pub fn new(transform_size: usize, sample_rate: u32) -> Result<Denoiser, JsValue> {
        let context = TransformContext::new(transform_size, sample_rate).map_err(to_js)?;
        Ok(Denoiser {
            context,
            contours: InMemoryContours::new(),
        })
    }

    /// Register the loudness contour (bin order) used for a transform size
    #[wasm_bindgen]
    pub fn set_loudness_contour(&mut self, transform_size: usize, contour: Vec<f64>) {
        self.contours.insert(transform_size, contour);
    }

    /// Apply parameters in the line-oriented text format
    #[wasm_bindgen]
    pub fn configure(&mut self, parameters: &str) -> Result<(), JsValue> {
        let parameters: SubtractionParameters = parameters.parse().map_err(to_js)?;
        parameters
            .apply(&mut self.context, Arc::new(self.contours.clone()))
            .map_err(to_js)
    }

    /// Denoise 16-bit samples
    #[wasm_bindgen]
    pub fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, JsValue> {
        self.context.read_pcm_buffer(input);
        self.context.process().map_err(to_js)?;
        Ok(self.context.to_pcm())
    }

    /// Denoise float samples in [-1, 1]
    #[wasm_bindgen]
    pub fn process_float(&mut self, input: &[f32]) -> Result<Vec<f32>, JsValue> {
        let samples: Vec<f64> = input.iter().map(|&s| s as f64).collect();
        self.context.load_samples(&samples);
        self.context.process().map_err(to_js)?;
        Ok(self.context.sample_data().iter().map(|&s| s as f32).collect())
    }

    #[wasm_bindgen]
    pub fn set_overlap_add(&mut self, enabled: bool) {
        let framing = if enabled {
            FramingMode::OverlapAdd
        } else {
            FramingMode::Direct
        };
        self.context.set_framing(framing);
    }

    #[wasm_bindgen]
    pub fn set_iterations(&mut self, iterations: usize) {
        self.context.set_iterations(iterations);
    }

    /// Enables or disables bypass mode
    #[wasm_bindgen]
    pub fn set_bypass(&mut self, bypass: bool) {
        self.context.set_bypass(bypass);
    }

    #[wasm_bindgen]
    pub fn set_transform_size(&mut self, transform_size: usize) -> Result<(), JsValue> {
        self.context.set_transform_size(transform_size).map_err(to_js)
    }

    #[wasm_bindgen(getter)]
    pub fn transform_size(&self) -> usize {
        self.context.transform_size()
    }

    #[wasm_bindgen(getter)]
    pub fn sample_rate(&self) -> u32 {
        self.context.sample_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_returns_input() {
        let mut denoiser = Denoiser::new(64, 16000).ok().unwrap();
        denoiser.set_bypass(true);
        let input: Vec<i16> = (0..200).map(|i| (i * 37 % 2000) as i16 - 1000).collect();
        assert_eq!(denoiser.process(&input).ok().unwrap(), input);
    }

    #[test]
    fn test_configure_and_process() {
        let mut denoiser = Denoiser::new(32, 16000).ok().unwrap();
        denoiser.set_loudness_contour(32, vec![60.0; 16]);
        denoiser.configure("2 0.02 0.05 0.0005 2 martin el").ok().unwrap();
        denoiser.set_overlap_add(true);

        let input: Vec<f32> = (0..300).map(|i| (i as f32 * 0.3).sin() * 0.5).collect();
        let output = denoiser.process_float(&input).ok().unwrap();
        assert_eq!(output.len(), input.len());
        assert!(output.iter().all(|s| s.is_finite()));
    }
}
