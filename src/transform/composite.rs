//! Per-pixel median compositing of masked scenes.

use super::MaskedScene;
use crate::error::{PipelineError, Result};
use crate::grid::GridChunk;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;

/// Median composite of one grid window, restricted to a band subset.
#[derive(Debug, Clone)]
pub struct Composite {
    pub band_names: Vec<String>,

    /// Grid window covered by `data`
    pub window: GridChunk,

    /// Reflectance: (band, row, col), NaN where no-data
    pub data: Array3<f32>,

    /// Number of valid observations per pixel (zero outside the region)
    pub coverage: Array2<u32>,
}

impl Composite {
    pub fn shape(&self) -> (usize, usize) {
        self.coverage.dim()
    }

    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.band_names.iter().position(|b| b == name)
    }

    pub fn band(&self, name: &str) -> Option<ArrayView2<'_, f32>> {
        self.band_index(name).map(|i| self.data.index_axis(Axis(0), i))
    }

    /// Band values at a window-local pixel, `None` for no-data.
    pub fn pixel_values(&self, row: usize, col: usize) -> Vec<Option<f32>> {
        (0..self.band_names.len())
            .map(|band| {
                let value = self.data[[band, row, col]];
                value.is_finite().then_some(value)
            })
            .collect()
    }

    /// Number of pixels with at least one valid observation.
    pub fn valid_pixels(&self) -> usize {
        self.coverage.iter().filter(|&&c| c > 0).count()
    }
}

/// Accumulator collecting masked observations of one window for a median
/// composite.
///
/// Observations are kept per scene (band subset only) until `finalize`,
/// since a median needs every value at a pixel. The rest of each added scene
/// is dropped on `add`.
#[derive(Debug)]
pub struct MedianAccumulator {
    /// Bands to retain, in output order
    bands: Vec<String>,

    window: GridChunk,

    /// Band subset of every added scene: (band, row, col)
    observations: Vec<Array3<f32>>,

    /// Count of valid observations for each pixel
    count: Array2<u32>,
}

impl MedianAccumulator {
    pub fn new(bands: &[String], window: GridChunk) -> Self {
        Self {
            bands: bands.to_vec(),
            window,
            observations: Vec::new(),
            count: Array2::zeros(window.shape()),
        }
    }

    /// Add a masked scene, keeping only the configured bands.
    pub fn add(&mut self, scene: MaskedScene) -> Result<()> {
        if scene.window.pixel_bounds() != self.window.pixel_bounds() || scene.shape() != self.window.shape() {
            return Err(PipelineError::WindowMismatch {
                expected: self.window.pixel_bounds(),
                actual: scene.window.pixel_bounds(),
            });
        }

        let indices = self
            .bands
            .iter()
            .map(|band| {
                scene.band_index(band).ok_or_else(|| PipelineError::MissingBand {
                    scene_id: scene.meta.scene_id.clone(),
                    band: band.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let subset = scene.data.select(Axis(0), &indices);

        if let Some(first) = subset.axis_iter(Axis(0)).next() {
            for (count, value) in self.count.iter_mut().zip(first.iter()) {
                if value.is_finite() {
                    *count += 1;
                }
            }
        }

        self.observations.push(subset);
        Ok(())
    }

    /// Number of scenes added.
    pub fn num_scenes(&self) -> usize {
        self.observations.len()
    }

    /// Get the maximum overlap count.
    pub fn max_overlap(&self) -> u32 {
        self.count.iter().copied().max().unwrap_or(0)
    }

    /// Compute the per-pixel median, clipped to `region_mask`.
    pub fn finalize(self, region_mask: &Array2<bool>) -> Result<Composite> {
        let (height, width) = self.window.shape();
        if region_mask.dim() != (height, width) {
            return Err(PipelineError::ShapeMismatch {
                expected: (height, width),
                actual: region_mask.dim(),
            });
        }

        let num_pixels = height * width;
        let num_scenes = self.observations.len();
        let mut data = Array3::from_elem((self.bands.len(), height, width), f32::NAN);

        for band in 0..self.bands.len() {
            let medians: Vec<f32> = (0..num_pixels)
                .into_par_iter()
                .map_init(
                    || Vec::with_capacity(num_scenes),
                    |values, pixel| {
                        let (row, col) = (pixel / width, pixel % width);
                        if !region_mask[[row, col]] {
                            return f32::NAN;
                        }
                        values.clear();
                        values.extend(
                            self.observations
                                .iter()
                                .map(|obs| obs[[band, row, col]])
                                .filter(|v| v.is_finite()),
                        );
                        median(values).unwrap_or(f32::NAN)
                    },
                )
                .collect();

            for (dst, value) in data.index_axis_mut(Axis(0), band).iter_mut().zip(medians) {
                *dst = value;
            }
        }

        let mut coverage = self.count;
        for (count, inside) in coverage.iter_mut().zip(region_mask.iter()) {
            if !inside {
                *count = 0;
            }
        }

        Ok(Composite {
            band_names: self.bands,
            window: self.window,
            data,
            coverage,
        })
    }
}

/// Median of finite values; the mean of the two middle values for an even count.
fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Composite the masked scenes of one window over the configured bands,
/// clipped to the window's region mask.
pub fn composite_scenes(
    scenes: Vec<MaskedScene>,
    bands: &[String],
    window: &GridChunk,
    region_mask: &Array2<bool>,
) -> Result<Composite> {
    if scenes.is_empty() {
        return Err(PipelineError::EmptyCollection {
            filter: "no masked scenes to composite".to_string(),
        });
    }

    let mut accumulator = MedianAccumulator::new(bands, *window);
    for scene in scenes {
        accumulator.add(scene)?;
    }

    let num_scenes = accumulator.num_scenes();
    let max_overlap = accumulator.max_overlap();
    let composite = accumulator.finalize(region_mask)?;

    tracing::debug!(
        "Composite of {} scenes at chunk ({}, {}): {}/{} pixels with data, max {} observations per pixel",
        num_scenes,
        window.row_idx,
        window.col_idx,
        composite.valid_pixels(),
        window.num_pixels(),
        max_overlap
    );

    Ok(composite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Scene, SceneMeta};
    use crate::transform::{mask_scenes, CloudMask};
    use chrono::NaiveDate;

    fn window(height: usize, width: usize) -> GridChunk {
        GridChunk {
            row_idx: 0,
            col_idx: 0,
            row: 0,
            col: 0,
            height,
            width,
        }
    }

    fn meta(id: &str) -> SceneMeta {
        SceneMeta {
            scene_id: id.to_string(),
            location: id.to_string(),
            acquired: NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(),
            cloud_pct: 1.0,
            footprint_wgs84: [0.0, 0.0, 1.0, 1.0],
        }
    }

    fn bands(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn masked(id: &str, names: &[&str], data: Array3<f32>) -> MaskedScene {
        let valid_pixels = data.index_axis(Axis(0), 0).iter().filter(|v| v.is_finite()).count();
        let (_, height, width) = data.dim();
        MaskedScene {
            meta: meta(id),
            window: window(height, width),
            band_names: bands(names),
            data,
            valid_pixels,
        }
    }

    fn uniform(id: &str, value: f32) -> MaskedScene {
        masked(id, &["B4", "B8"], Array3::from_elem((2, 1, 1), value))
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&mut [0.3, 0.1, 0.2]), Some(0.2));
        assert_eq!(median(&mut [0.4, 0.1, 0.2, 0.3]), Some(0.25));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn test_single_scene_is_identity() {
        let data = Array3::from_shape_vec((2, 1, 2), vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let scene = masked("a", &["B4", "B8"], data.clone());
        let region = Array2::from_elem((1, 2), true);

        let composite = composite_scenes(vec![scene], &bands(&["B4", "B8"]), &window(1, 2), &region).unwrap();
        assert_eq!(composite.data, data);
        assert_eq!(composite.valid_pixels(), 2);
    }

    #[test]
    fn test_masked_observations_excluded() {
        let region = Array2::from_elem((1, 1), true);
        let scenes = vec![uniform("a", 0.1), uniform("b", f32::NAN), uniform("c", 0.3), uniform("d", 0.9)];

        let composite = composite_scenes(scenes, &bands(&["B4"]), &window(1, 1), &region).unwrap();
        assert_eq!(composite.data[[0, 0, 0]], 0.3);
        assert_eq!(composite.coverage[[0, 0]], 3);
    }

    #[test]
    fn test_band_subset_in_configured_order() {
        let data = Array3::from_shape_vec((3, 1, 1), vec![0.1, 0.2, 0.3]).unwrap();
        let scene = masked("a", &["B2", "B4", "B8"], data);
        let region = Array2::from_elem((1, 1), true);

        let composite = composite_scenes(vec![scene], &bands(&["B8", "B2"]), &window(1, 1), &region).unwrap();
        assert_eq!(composite.band_names, bands(&["B8", "B2"]));
        assert_eq!(composite.pixel_values(0, 0), vec![Some(0.3), Some(0.1)]);
    }

    #[test]
    fn test_missing_band() {
        let region = Array2::from_elem((1, 1), true);
        let err = composite_scenes(vec![uniform("a", 0.1)], &bands(&["B4", "B11"]), &window(1, 1), &region).unwrap_err();
        assert!(matches!(err, PipelineError::MissingBand { ref band, .. } if band == "B11"));
    }

    #[test]
    fn test_no_observations_is_nodata() {
        let region = Array2::from_elem((1, 1), true);
        let composite = composite_scenes(vec![uniform("a", f32::NAN)], &bands(&["B4"]), &window(1, 1), &region).unwrap();
        assert!(composite.data[[0, 0, 0]].is_nan());
        assert_eq!(composite.pixel_values(0, 0), vec![None]);
        assert_eq!(composite.valid_pixels(), 0);
    }

    #[test]
    fn test_clipped_to_region() {
        let scene = masked("a", &["B4"], Array3::from_elem((1, 1, 2), 0.2));
        let region = Array2::from_shape_vec((1, 2), vec![true, false]).unwrap();

        let composite = composite_scenes(vec![scene], &bands(&["B4"]), &window(1, 2), &region).unwrap();
        assert_eq!(composite.data[[0, 0, 0]], 0.2);
        assert!(composite.data[[0, 0, 1]].is_nan());
        assert_eq!(composite.coverage[[0, 1]], 0);
    }

    #[test]
    fn test_empty_input() {
        let region = Array2::from_elem((1, 1), true);
        let err = composite_scenes(vec![], &bands(&["B4"]), &window(1, 1), &region).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyCollection { .. }));
    }

    #[test]
    fn test_shape_mismatch() {
        let region = Array2::from_elem((2, 2), true);
        let err = composite_scenes(vec![uniform("a", 0.1)], &bands(&["B4"]), &window(1, 1), &region).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_window_mismatch() {
        let mut accumulator = MedianAccumulator::new(&bands(&["B4"]), window(1, 1));
        let mut scene = uniform("a", 0.1);
        scene.window.col = 3;
        let err = accumulator.add(scene).unwrap_err();
        assert!(matches!(err, PipelineError::WindowMismatch { .. }));
        assert_eq!(accumulator.num_scenes(), 0);
    }

    #[test]
    fn test_composite_of_masked_raw_scenes() {
        // (B4 DN, B8 DN, QA) per scene
        let observations = [
            (1000u16, 4000u16, 0u16),
            (9000, 9000, 1 << 10),
            (3000, 6000, 0),
            (9500, 9500, 1 << 11),
            (2000, 5000, 0),
        ];
        let scenes: Vec<Scene> = observations
            .iter()
            .enumerate()
            .map(|(i, &(red, nir, qa))| Scene {
                meta: meta(&format!("s{}", i)),
                window: window(1, 1),
                band_names: bands(&["B4", "B8"]),
                bands: Array3::from_shape_vec((2, 1, 1), vec![red, nir]).unwrap(),
                qa: Array2::from_elem((1, 1), qa),
            })
            .collect();

        let masked = mask_scenes(scenes, &CloudMask::default());
        assert_eq!(masked.iter().map(|m| m.valid_pixels).sum::<usize>(), 3);

        let region = Array2::from_elem((1, 1), true);
        let composite = composite_scenes(masked, &bands(&["B4", "B8"]), &window(1, 1), &region).unwrap();

        // Clear observations only: B4 {0.1, 0.3, 0.2}, B8 {0.4, 0.6, 0.5}
        assert_eq!(composite.data[[0, 0, 0]], 0.2);
        assert_eq!(composite.data[[1, 0, 0]], 0.5);
        assert_eq!(composite.coverage[[0, 0]], 3);
    }

    #[test]
    fn test_coverage_counts_past_u16() {
        let observations = u16::MAX as usize + 2;
        let mut accumulator = MedianAccumulator::new(&bands(&["B4"]), window(1, 1));
        for i in 0..observations {
            accumulator.add(uniform(&format!("s{}", i), 0.25)).unwrap();
        }
        assert_eq!(accumulator.num_scenes(), observations);
        assert_eq!(accumulator.max_overlap(), 65_537);

        let composite = accumulator.finalize(&Array2::from_elem((1, 1), true)).unwrap();
        assert_eq!(composite.coverage[[0, 0]], 65_537);
        assert_eq!(composite.data[[0, 0, 0]], 0.25);
    }
}
