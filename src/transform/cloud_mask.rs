//! QA-bitmask cloud masking and reflectance scaling.

use crate::archive::{Scene, SceneMeta};
use crate::grid::GridChunk;
use ndarray::{Array2, Array3};
use rayon::prelude::*;

/// Per-scene cloud mask parameters.
///
/// A pixel is valid iff both QA bits are zero and the pixel is not raw
/// no-data in every band (outside the scene footprint).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloudMask {
    /// QA bit flagging opaque clouds
    pub cloud_bit: u8,

    /// QA bit flagging cirrus
    pub cirrus_bit: u8,

    /// Raw DN divisor producing reflectance
    pub scale_factor: f32,

    /// Raw value marking pixels outside the scene footprint
    pub nodata: Option<u16>,
}

impl Default for CloudMask {
    fn default() -> Self {
        Self {
            cloud_bit: 10,
            cirrus_bit: 11,
            scale_factor: 10_000.0,
            nodata: Some(0),
        }
    }
}

/// A scene window after masking: scaled reflectance, NaN where invalid.
#[derive(Debug, Clone)]
pub struct MaskedScene {
    pub meta: SceneMeta,

    /// Grid window covered by `data`
    pub window: GridChunk,

    pub band_names: Vec<String>,

    /// Reflectance: (band, row, col)
    pub data: Array3<f32>,

    /// Number of valid pixels
    pub valid_pixels: usize,
}

impl MaskedScene {
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.band_names.iter().position(|b| b == name)
    }
}

impl CloudMask {
    fn qa_bits(&self) -> u16 {
        (1u16 << self.cloud_bit) | (1u16 << self.cirrus_bit)
    }

    /// Validity mask of a scene.
    pub fn validity(&self, scene: &Scene) -> Array2<bool> {
        let bits = self.qa_bits();
        let num_bands = scene.bands.dim().0;

        Array2::from_shape_fn(scene.shape(), |(row, col)| {
            if scene.qa[[row, col]] & bits != 0 {
                return false;
            }
            match self.nodata {
                Some(nodata) if num_bands > 0 => (0..num_bands).any(|b| scene.bands[[b, row, col]] != nodata),
                _ => true,
            }
        })
    }

    /// Mask a scene and scale its values to reflectance, consuming the raw scene.
    pub fn apply(&self, scene: Scene) -> MaskedScene {
        let valid = self.validity(&scene);
        let valid_pixels = valid.iter().filter(|&&v| v).count();

        let data = Array3::from_shape_fn(scene.bands.dim(), |(band, row, col)| {
            if valid[[row, col]] {
                scene.bands[[band, row, col]] as f32 / self.scale_factor
            } else {
                f32::NAN
            }
        });

        tracing::debug!(
            "Masked scene {} ({}) rows {}.. cols {}..: {}/{} pixels valid",
            scene.meta.scene_id,
            scene.meta.acquired,
            scene.window.row,
            scene.window.col,
            valid_pixels,
            valid.len()
        );

        MaskedScene {
            meta: scene.meta,
            window: scene.window,
            band_names: scene.band_names,
            data,
            valid_pixels,
        }
    }
}

/// Mask every scene in parallel, preserving input order.
///
/// Each raw scene is dropped as soon as its masked copy exists.
pub fn mask_scenes(scenes: Vec<Scene>, mask: &CloudMask) -> Vec<MaskedScene> {
    scenes.into_par_iter().map(|scene| mask.apply(scene)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn scene(bands: Array3<u16>, qa: Array2<u16>) -> Scene {
        let (height, width) = qa.dim();
        Scene {
            meta: SceneMeta {
                scene_id: "s".to_string(),
                location: "s".to_string(),
                acquired: NaiveDate::from_ymd_opt(2023, 6, 3).unwrap(),
                cloud_pct: 10.0,
                footprint_wgs84: [0.0, 0.0, 1.0, 1.0],
            },
            window: GridChunk {
                row_idx: 0,
                col_idx: 0,
                row: 0,
                col: 0,
                height,
                width,
            },
            band_names: vec!["B4".to_string(), "B8".to_string()],
            bands,
            qa,
        }
    }

    #[test]
    fn test_qa_bits_invalidate_pixels() {
        let bands = Array3::from_elem((2, 2, 2), 1500u16);
        let mut qa = Array2::zeros((2, 2));
        qa[[0, 0]] = 1 << 10;
        qa[[0, 1]] = 1 << 11;
        qa[[1, 0]] = 1 << 3; // unrelated bit

        let masked = CloudMask::default().apply(scene(bands, qa));

        assert!(masked.data[[0, 0, 0]].is_nan());
        assert!(masked.data[[1, 0, 1]].is_nan());
        assert_eq!(masked.data[[0, 1, 0]], 0.15);
        assert_eq!(masked.data[[1, 1, 1]], 0.15);
        assert_eq!(masked.valid_pixels, 2);
        assert_eq!(masked.meta.acquired, NaiveDate::from_ymd_opt(2023, 6, 3).unwrap());
    }

    #[test]
    fn test_footprint_fill_is_invalid() {
        let mut bands = Array3::from_elem((2, 1, 2), 800u16);
        bands[[0, 0, 1]] = 0;
        bands[[1, 0, 1]] = 0;
        let masked = CloudMask::default().apply(scene(bands, Array2::zeros((1, 2))));

        assert_eq!(masked.valid_pixels, 1);
        assert!(masked.data[[0, 0, 1]].is_nan());
    }

    #[test]
    fn test_single_zero_band_is_valid() {
        let mut bands = Array3::from_elem((2, 1, 1), 800u16);
        bands[[0, 0, 0]] = 0;
        let masked = CloudMask::default().apply(scene(bands, Array2::zeros((1, 1))));

        assert_eq!(masked.valid_pixels, 1);
        assert_eq!(masked.data[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_mask_scenes_preserves_order() {
        let mut scenes = Vec::new();
        for i in 0..5 {
            let mut s = scene(Array3::from_elem((2, 1, 1), 100), Array2::zeros((1, 1)));
            s.meta.scene_id = format!("s{}", i);
            scenes.push(s);
        }
        let masked = mask_scenes(scenes, &CloudMask::default());
        let ids: Vec<_> = masked.iter().map(|m| m.meta.scene_id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4"]);
    }
}
