//! Subtraction parameters
//!
//! Parameters come either as the line-oriented text format, whitespace
//! separated values in a fixed order:
//!
//! ```text
//! alpha
//! beta
//! alpha_weight
//! beta_weight
//! iterations
//! estimator   (std | martin | wavelets)
//! algorithm   (std | el | ga | bypass)
//! ```
//!
//! or as a JSON object with the same field names.

use crate::context::{ContextError, TransformContext};
use crate::loudness::ContourSource;
use crate::noise_estimation::EstimationAlgorithm;
use crate::spectral_subtraction::{
    shared_subtraction, EqualLoudnessSubtraction, GeometricSubtraction, StandardSubtraction,
    SubtractionAlgorithm, DEFAULT_ALPHA, DEFAULT_ALPHA_WEIGHT, DEFAULT_BETA, DEFAULT_BETA_WEIGHT,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing parameter: {0}")]
    MissingField(&'static str),

    #[error("Invalid value '{token}' for {field}")]
    InvalidValue { field: &'static str, token: String },

    #[error("Invalid JSON parameters: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Context(#[from] ContextError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Parameters
// ============================================================================

/// Everything needed to set up the strategies of a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtractionParameters {
    /// Over-subtraction factor
    pub alpha: f64,

    /// Spectral floor
    pub beta: f64,

    /// Equal-loudness weight of alpha, per phon
    pub alpha_weight: f64,

    /// Equal-loudness weight of beta, per phon
    pub beta_weight: f64,

    /// Passes over the signal
    pub iterations: usize,

    /// Estimator token
    pub estimator: String,

    /// Subtraction token
    pub algorithm: String,
}

impl Default for SubtractionParameters {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            alpha_weight: DEFAULT_ALPHA_WEIGHT,
            beta_weight: DEFAULT_BETA_WEIGHT,
            iterations: 1,
            estimator: EstimationAlgorithm::Simple.token().to_string(),
            algorithm: SubtractionAlgorithm::Standard.token().to_string(),
        }
    }
}

fn next_token<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<&'a str> {
    tokens.next().ok_or(ConfigError::MissingField(field))
}

fn parse_number<'a, T: FromStr>(
    tokens: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<T> {
    let token = next_token(tokens, field)?;
    token.parse().map_err(|_| ConfigError::InvalidValue {
        field,
        token: token.to_string(),
    })
}

impl FromStr for SubtractionParameters {
    type Err = ConfigError;

    /// Parse the line-oriented format
    fn from_str(text: &str) -> Result<Self> {
        let mut tokens = text.split_whitespace();

        let alpha = parse_number(&mut tokens, "alpha")?;
        let beta = parse_number(&mut tokens, "beta")?;
        let alpha_weight = parse_number(&mut tokens, "alpha_weight")?;
        let beta_weight = parse_number(&mut tokens, "beta_weight")?;
        let iterations: i64 = parse_number(&mut tokens, "iterations")?;
        let estimator = next_token(&mut tokens, "estimator")?.to_string();
        let algorithm = next_token(&mut tokens, "algorithm")?.to_string();

        let trailing = tokens.count();
        if trailing > 0 {
            log::warn!("Ignoring {} trailing parameter tokens", trailing);
        }

        Ok(Self {
            alpha,
            beta,
            alpha_weight,
            beta_weight,
            iterations: iterations.max(1) as usize,
            estimator,
            algorithm,
        })
    }
}

impl SubtractionParameters {
    /// Load from a file; `.json` files are read as JSON
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let parameters = if is_json {
            Self::from_json(&text)?
        } else {
            text.parse()?
        };

        log::debug!("Loaded subtraction parameters from {}", path.display());
        Ok(parameters)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let parameters: Self = serde_json::from_str(text)?;
        Ok(parameters)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate numeric parameters
    ///
    /// Non-positive coefficients are accepted, they are clamped when applied.
    pub fn validate(&self) -> Result<()> {
        let coefficients = [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("alpha_weight", self.alpha_weight),
            ("beta_weight", self.beta_weight),
        ];
        for (name, value) in coefficients {
            if !value.is_finite() {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "{} must be finite, got {}",
                    name, value
                )));
            }
        }

        if self.iterations == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configure the strategies of `context`
    ///
    /// Unknown tokens are reported and leave the current strategy attached.
    /// The `bypass` algorithm sets the context's bypass flag, any other known
    /// algorithm clears it. `contours` backs the equal-loudness algorithm.
    pub fn apply(&self, context: &mut TransformContext, contours: Arc<dyn ContourSource>) -> Result<()> {
        context.set_iterations(self.iterations);

        match self.estimator.parse::<EstimationAlgorithm>() {
            Ok(algorithm) => context.set_estimator(algorithm.create()),
            Err(message) => log::warn!(
                "{}; keeping the {} estimator",
                message,
                context.estimator().borrow().algorithm()
            ),
        }

        let algorithm = match self.algorithm.parse::<SubtractionAlgorithm>() {
            Ok(algorithm) => algorithm,
            Err(message) => {
                log::warn!(
                    "{}; keeping the {} subtraction",
                    message,
                    context.subtractor().borrow().algorithm()
                );
                return Ok(());
            }
        };

        match algorithm {
            SubtractionAlgorithm::Standard => {
                let subtraction = StandardSubtraction::new(self.alpha, self.beta);
                context.set_subtractor(shared_subtraction(subtraction))?;
            }
            SubtractionAlgorithm::EqualLoudness => {
                let mut subtraction = EqualLoudnessSubtraction::from_source(contours);
                subtraction.coefficients_mut().set_alpha(self.alpha);
                subtraction.coefficients_mut().set_beta(self.beta);
                subtraction.set_alpha_weight(self.alpha_weight);
                subtraction.set_beta_weight(self.beta_weight);
                context.set_subtractor(shared_subtraction(subtraction))?;
            }
            SubtractionAlgorithm::Geometric => {
                context.set_subtractor(shared_subtraction(GeometricSubtraction::new()))?;
            }
            SubtractionAlgorithm::Bypass => {}
        }

        context.set_bypass(algorithm == SubtractionAlgorithm::Bypass);
        Ok(())
    }
}
