//! Normalized difference spectral indices.

use super::Composite;
use crate::error::{PipelineError, Result};
use ndarray::{Array2, ArrayView2, Zip};

/// Single-band index raster aligned to the composite grid, NaN where no-data.
#[derive(Debug, Clone)]
pub struct IndexImage {
    pub data: Array2<f32>,
}

impl IndexImage {
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        let value = self.data[[row, col]];
        value.is_finite().then_some(value)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }
}

/// `(a - b) / (a + b)` per pixel; no-data where either input is no-data or
/// the denominator is zero.
pub fn normalized_difference(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Result<IndexImage> {
    if a.dim() != b.dim() {
        return Err(PipelineError::ShapeMismatch {
            expected: a.dim(),
            actual: b.dim(),
        });
    }

    let data = Zip::from(&a).and(&b).map_collect(|&a, &b| {
        let sum = a + b;
        if !a.is_finite() || !b.is_finite() || sum == 0.0 {
            return f32::NAN;
        }
        let value = (a - b) / sum;
        if value.is_finite() {
            value
        } else {
            f32::NAN
        }
    });

    Ok(IndexImage { data })
}

/// Fail when none of `pixels` index pixels is defined.
///
/// Applied once over the whole run; a single chunk may be entirely no-data.
pub fn check_defined(valid: usize, pixels: usize) -> Result<()> {
    if valid == 0 {
        return Err(PipelineError::DegenerateIndex { pixels });
    }
    Ok(())
}

/// NDVI from the composite's near-infrared and red bands.
pub fn compute_ndvi(composite: &Composite, nir_band: &str, red_band: &str) -> Result<IndexImage> {
    let missing = |band: &str| PipelineError::MissingBand {
        scene_id: "composite".to_string(),
        band: band.to_string(),
    };
    let nir = composite.band(nir_band).ok_or_else(|| missing(nir_band))?;
    let red = composite.band(red_band).ok_or_else(|| missing(red_band))?;

    let ndvi = normalized_difference(nir, red)?;

    tracing::debug!(
        "NDVI ({} vs {}) at chunk ({}, {}): {}/{} valid pixels",
        nir_band,
        red_band,
        composite.window.row_idx,
        composite.window.col_idx,
        ndvi.valid_count(),
        ndvi.data.len()
    );

    Ok(ndvi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridChunk;
    use ndarray::{array, Array3};

    #[test]
    fn test_ndvi_values() {
        let nir = array![[0.5f32, 0.3], [0.2, 0.0]];
        let red = array![[0.1f32, 0.3], [0.6, 0.4]];
        let index = normalized_difference(nir.view(), red.view()).unwrap();

        assert!((index.data[[0, 0]] - 0.6667).abs() < 1e-3);
        assert_eq!(index.data[[0, 1]], 0.0);
        assert!((index.data[[1, 0]] + 0.5).abs() < 1e-6);
        assert_eq!(index.data[[1, 1]], -1.0);
    }

    #[test]
    fn test_zero_denominator_is_nodata() {
        let nir = array![[0.0f32, 0.4]];
        let red = array![[0.0f32, 0.1]];
        let index = normalized_difference(nir.view(), red.view()).unwrap();

        assert_eq!(index.get(0, 0), None);
        assert!(index.get(0, 1).is_some());
        assert_eq!(index.valid_count(), 1);
    }

    #[test]
    fn test_nodata_inputs_propagate() {
        let nir = array![[f32::NAN, 0.4]];
        let red = array![[0.1f32, f32::NAN]];
        let index = normalized_difference(nir.view(), red.view()).unwrap();
        assert_eq!(index.valid_count(), 0);

        let err = check_defined(index.valid_count(), index.data.len()).unwrap_err();
        assert!(matches!(err, PipelineError::DegenerateIndex { pixels: 2 }));
        assert!(check_defined(1, 2).is_ok());
    }

    #[test]
    fn test_range_within_unit_interval() {
        let nir = Array2::from_shape_fn((8, 8), |(r, c)| (r * 8 + c) as f32 / 100.0);
        let red = Array2::from_shape_fn((8, 8), |(r, c)| ((63 - r * 8 - c) as f32) / 100.0);
        let index = normalized_difference(nir.view(), red.view()).unwrap();
        assert!(index.data.iter().filter(|v| v.is_finite()).all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_compute_ndvi_missing_band() {
        let composite = Composite {
            band_names: vec!["B4".to_string()],
            window: GridChunk {
                row_idx: 0,
                col_idx: 0,
                row: 0,
                col: 0,
                height: 1,
                width: 1,
            },
            data: Array3::from_elem((1, 1, 1), 0.1),
            coverage: Array2::from_elem((1, 1), 1),
        };
        let err = compute_ndvi(&composite, "B8", "B4").unwrap_err();
        assert!(matches!(err, PipelineError::MissingBand { ref band, .. } if band == "B8"));
    }
}
