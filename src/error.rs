//! Error taxonomy for the labeling pipeline.
//!
//! Fatal conditions are [`PipelineError`] variants. Partial results that the
//! caller must be told about (too few candidate pixels, points on no-data
//! composite pixels) are not errors; they travel in the run report instead.

use crate::transform::ClassLabel;
use thiserror::Error;

/// Fatal pipeline errors.
///
/// Application code wraps these in `anyhow::Error`; callers that need to react
/// to a specific condition can recover it with `downcast_ref::<PipelineError>()`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No scenes in the collection ({filter})")]
    EmptyCollection { filter: String },

    #[error("Index image has no valid pixels ({pixels} pixels, all no-data)")]
    DegenerateIndex { pixels: usize },

    #[error("Scene {scene_id} is missing required band {band}")]
    MissingBand { scene_id: String, band: String },

    #[error("Raster shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Raster window mismatch: expected pixels {expected:?}, got {actual:?}")]
    WindowMismatch { expected: [usize; 4], actual: [usize; 4] },

    #[error("Resolution mismatch: sampling at {expected}, composite grid at {actual}")]
    ResolutionMismatch { expected: f64, actual: f64 },

    #[error("Export to {destination} failed: {source}")]
    Export {
        destination: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for the pure pipeline stages.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// A class mask held fewer candidate pixels than the requested sample count.
///
/// Non-fatal: the sampler returns every available pixel and the shortfall is
/// surfaced in the run report.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SampleShortfall {
    pub class: ClassLabel,
    pub requested: usize,
    pub available: usize,
}

impl std::fmt::Display for SampleShortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Insufficient samples for class {}: requested {}, only {} valid pixels",
            self.class, self.requested, self.available
        )
    }
}
