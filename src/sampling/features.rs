//! Attach composite band values to sample points.

use super::sampler::check_scale;
use super::SamplePoint;
use crate::error::{PipelineError, Result};
use crate::grid::PixelGrid;
use crate::transform::Composite;

/// Read every composite band at each point's coordinate.
///
/// The composite may cover a single window of the grid. Points on no-data
/// composite pixels, or outside the window, get every value set to `None`.
/// Values come back in point order.
pub fn extract_features(
    points: &[SamplePoint],
    composite: &Composite,
    grid: &PixelGrid,
    scale: f64,
) -> Result<Vec<Vec<Option<f32>>>> {
    check_scale(scale, grid)?;
    if composite.shape() != composite.window.shape() {
        return Err(PipelineError::ShapeMismatch {
            expected: composite.window.shape(),
            actual: composite.shape(),
        });
    }

    let num_bands = composite.band_names.len();
    let values = points
        .iter()
        .map(|point| {
            match grid
                .crs_to_pixel(point.x, point.y)
                .and_then(|(row, col)| composite.window.local(row, col))
            {
                Some((row, col)) => composite.pixel_values(row, col),
                None => vec![None; num_bands],
            }
        })
        .collect();

    Ok(values)
}
