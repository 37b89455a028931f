//! Equal-loudness contour tables
//!
//! A contour holds one perceptual loudness value (in phon, relative to a
//! 60 phon reference curve) per non-redundant frequency bin of a given
//! transform size: `transform_size / 2` values. Data files store the values
//! of the symmetric spectrum starting from the highest frequency, so the
//! first half of a file is read and reversed into bin order.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoudnessError {
    #[error("No loudness contour available for transform size {transform_size}")]
    Missing { transform_size: usize },

    #[error("Loudness contour for transform size {transform_size} is short: need {expected} values, found {found}")]
    Short { transform_size: usize, expected: usize, found: usize },

    #[error("Invalid loudness value '{token}' in {path}")]
    Parse { path: String, token: String },

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },
}

// ============================================================================
// Sources
// ============================================================================

/// Provider of raw contour data, keyed by transform size
///
/// Implementations return exactly `transform_size / 2` values in bin
/// (frequency-ascending) order.
pub trait ContourSource {
    fn load(&self, transform_size: usize) -> Result<Vec<f64>, LoudnessError>;
}

/// Contour files in a directory, named `loudness_<N>.data`
#[derive(Debug, Clone)]
pub struct ContourDirectory {
    root: PathBuf,
}

impl ContourDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the data file for a transform size
    pub fn path_for(&self, transform_size: usize) -> PathBuf {
        self.root.join(format!("loudness_{}.data", transform_size))
    }
}

impl ContourSource for ContourDirectory {
    fn load(&self, transform_size: usize) -> Result<Vec<f64>, LoudnessError> {
        let path = self.path_for(transform_size);
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoudnessError::Missing { transform_size },
            _ => LoudnessError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            },
        })?;

        let contour = parse_contour(&text, transform_size, &path.display().to_string())?;
        log::debug!(
            "Loaded loudness contour for transform size {} from {}",
            transform_size,
            path.display()
        );
        Ok(contour)
    }
}

/// Parse whitespace separated values and reverse the first half into bin order
pub fn parse_contour(text: &str, transform_size: usize, origin: &str) -> Result<Vec<f64>, LoudnessError> {
    let half = transform_size / 2;
    let mut contour = vec![0.0; half];

    let mut found = 0;
    for token in text.split_whitespace().take(half) {
        let value: f64 = token.parse().map_err(|_| LoudnessError::Parse {
            path: origin.to_string(),
            token: token.to_string(),
        })?;
        contour[half - 1 - found] = value;
        found += 1;
    }

    if found < half {
        return Err(LoudnessError::Short {
            transform_size,
            expected: half,
            found,
        });
    }

    Ok(contour)
}

/// Contours registered in memory, already in bin order
#[derive(Debug, Clone, Default)]
pub struct InMemoryContours {
    contours: HashMap<usize, Vec<f64>>,
}

impl InMemoryContours {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the contour used for `transform_size`
    pub fn insert(&mut self, transform_size: usize, contour: Vec<f64>) {
        self.contours.insert(transform_size, contour);
    }

    /// Builder-style registration
    pub fn with(mut self, transform_size: usize, contour: Vec<f64>) -> Self {
        self.insert(transform_size, contour);
        self
    }
}

impl ContourSource for InMemoryContours {
    fn load(&self, transform_size: usize) -> Result<Vec<f64>, LoudnessError> {
        let contour = self
            .contours
            .get(&transform_size)
            .ok_or(LoudnessError::Missing { transform_size })?;

        let expected = transform_size / 2;
        if contour.len() < expected {
            return Err(LoudnessError::Short {
                transform_size,
                expected,
                found: contour.len(),
            });
        }

        Ok(contour[..expected].to_vec())
    }
}

// ============================================================================
// Cached Table
// ============================================================================

/// Lazily loaded contours, cached per transform size
pub struct LoudnessContourTable {
    source: Arc<dyn ContourSource>,
    cache: HashMap<usize, Arc<[f64]>>,
}

impl LoudnessContourTable {
    pub fn new(source: Arc<dyn ContourSource>) -> Self {
        Self {
            source,
            cache: HashMap::new(),
        }
    }

    /// Contour for a transform size, loading it on first use
    pub fn contour(&mut self, transform_size: usize) -> Result<Arc<[f64]>, LoudnessError> {
        if let Some(contour) = self.cache.get(&transform_size) {
            return Ok(Arc::clone(contour));
        }

        let contour: Arc<[f64]> = self.source.load(transform_size)?.into();
        self.cache.insert(transform_size, Arc::clone(&contour));
        Ok(contour)
    }

    /// Whether the contour of a transform size has been loaded already
    pub fn is_cached(&self, transform_size: usize) -> bool {
        self.cache.contains_key(&transform_size)
    }
}

// ============================================================================
// Tests
// ============================================================================
