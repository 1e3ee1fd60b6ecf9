//! Imagery archive: scene metadata, collection filtering and scene loading.
//!
//! The archive is an external collaborator. It answers catalog queries and
//! delivers windows of each selected scene already resampled onto the
//! analysis grid; everything downstream of [`SceneArchive::load`] happens
//! in-process, one grid chunk at a time.

mod catalog;
mod memory;
pub mod synthetic;
mod zarr_scenes;

pub use catalog::{CatalogArchive, SceneCatalog};
pub use memory::MemoryArchive;
pub use zarr_scenes::SceneStore;

use crate::crs::{self, Bounds};
use crate::grid::{GridChunk, PixelGrid};
use crate::region::Region;
use anyhow::Result;
use chrono::NaiveDate;
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rstar::{RTreeObject, AABB};
use serde::{Deserialize, Serialize};

/// Catalog entry for one acquired scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMeta {
    /// Unique scene identifier
    pub scene_id: String,

    /// Location of the scene raster within the archive's scene store
    pub location: String,

    /// Capture date
    pub acquired: NaiveDate,

    /// Scene-wide cloudy pixel percentage reported by the provider (0-100)
    pub cloud_pct: f64,

    /// Footprint bounding box in WGS84 [min_lon, min_lat, max_lon, max_lat]
    pub footprint_wgs84: [f64; 4],
}

impl RTreeObject for SceneMeta {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.footprint_wgs84[0], self.footprint_wgs84[1]],
            [self.footprint_wgs84[2], self.footprint_wgs84[3]],
        )
    }
}

impl SceneMeta {
    /// Whether the footprint overlaps a WGS84 box; touching edges do not count.
    pub fn overlaps(&self, bounds_wgs84: &Bounds) -> bool {
        crs::intersect_bounds(&self.footprint_wgs84, bounds_wgs84).is_some()
    }
}

/// A window of a scene delivered on the analysis grid.
///
/// Spectral bands hold raw digital numbers; the QA band is the provider's
/// quality bitmask (QA60 for Sentinel-2).
#[derive(Debug, Clone)]
pub struct Scene {
    pub meta: SceneMeta,

    /// Grid pixels covered by the arrays
    pub window: GridChunk,

    /// Names of the spectral bands, in axis-0 order of `bands`
    pub band_names: Vec<String>,

    /// Raw band values: (band, row, col)
    pub bands: Array3<u16>,

    /// Quality bitmask: (row, col)
    pub qa: Array2<u16>,
}

impl Scene {
    /// Shape of one band as (rows, cols).
    pub fn shape(&self) -> (usize, usize) {
        self.qa.dim()
    }

    /// Index of a named band.
    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.band_names.iter().position(|b| b == name)
    }

    /// View of a named band.
    pub fn band(&self, name: &str) -> Option<ArrayView2<'_, u16>> {
        self.band_index(name).map(|i| self.bands.index_axis(Axis(0), i))
    }

    /// Check that band data, QA and names agree with each other and that the
    /// window lies on the grid.
    pub fn check_consistent(&self, grid: &PixelGrid) -> Result<()> {
        let (bands, rows, cols) = self.bands.dim();
        if bands != self.band_names.len() {
            anyhow::bail!(
                "Scene {} has {} band names for {} band planes",
                self.meta.scene_id,
                self.band_names.len(),
                bands
            );
        }
        if (rows, cols) != self.qa.dim() {
            anyhow::bail!(
                "Scene {} QA shape {:?} differs from band shape {:?}",
                self.meta.scene_id,
                self.qa.dim(),
                (rows, cols)
            );
        }
        if (rows, cols) != self.window.shape() {
            anyhow::bail!(
                "Scene {} shape {:?} does not match its window {:?}",
                self.meta.scene_id,
                (rows, cols),
                self.window.shape()
            );
        }
        let [_, _, end_row, end_col] = self.window.pixel_bounds();
        if end_row > grid.height || end_col > grid.width {
            anyhow::bail!(
                "Scene {} window {:?} extends past the analysis grid {:?}",
                self.meta.scene_id,
                self.window.pixel_bounds(),
                grid.shape()
            );
        }
        Ok(())
    }

    /// Copy of the part of this scene covered by `window`.
    pub fn slice(&self, window: &GridChunk) -> Result<Scene> {
        if window.num_pixels() == 0 {
            anyhow::bail!("Empty window requested from scene {}", self.meta.scene_id);
        }
        let [start_row, start_col, end_row, end_col] = window.pixel_bounds();
        let (Some((r0, c0)), Some((r1, c1))) = (
            self.window.local(start_row, start_col),
            self.window.local(end_row - 1, end_col - 1),
        ) else {
            anyhow::bail!(
                "Window {:?} is outside scene {} window {:?}",
                window.pixel_bounds(),
                self.meta.scene_id,
                self.window.pixel_bounds()
            );
        };

        Ok(Scene {
            meta: self.meta.clone(),
            window: *window,
            band_names: self.band_names.clone(),
            bands: self.bands.slice(s![.., r0..=r1, c0..=c1]).to_owned(),
            qa: self.qa.slice(s![r0..=r1, c0..=c1]).to_owned(),
        })
    }
}

/// Collection filter: region, inclusive date interval and cloud ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionFilter {
    pub region: Region,

    /// First acceptable capture date (inclusive)
    pub start: NaiveDate,

    /// Last acceptable capture date (inclusive)
    pub end: NaiveDate,

    /// Scenes must report strictly less cloud than this percentage
    pub max_cloud_pct: f64,
}

impl CollectionFilter {
    /// Whether a scene satisfies the date and cloud predicates and its footprint
    /// intersects the region.
    pub fn matches(&self, scene: &SceneMeta) -> bool {
        self.region.intersects(&scene.footprint_wgs84)
            && scene.acquired >= self.start
            && scene.acquired <= self.end
            && scene.cloud_pct < self.max_cloud_pct
    }
}

impl std::fmt::Display for CollectionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "region {}, {}..={}, cloud < {}%",
            self.region, self.start, self.end, self.max_cloud_pct
        )
    }
}

/// Query and load surface of an imagery archive.
#[allow(async_fn_in_trait)]
pub trait SceneArchive {
    /// Every scene matching the filter, in archive-native order.
    async fn query(&self, filter: &CollectionFilter) -> Result<Vec<SceneMeta>>;

    /// Fetch one scene's pixels on the analysis grid, limited to `window`.
    async fn load(&self, scene: &SceneMeta, grid: &PixelGrid, window: &GridChunk) -> Result<Scene>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, date: &str, cloud_pct: f64, footprint: [f64; 4]) -> SceneMeta {
        SceneMeta {
            scene_id: id.to_string(),
            location: format!("scenes/{}", id),
            acquired: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            cloud_pct,
            footprint_wgs84: footprint,
        }
    }

    fn season_filter() -> CollectionFilter {
        CollectionFilter {
            region: Region::new([-3.0, 6.5, -1.5, 8.5]).unwrap(),
            start: NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 7, 31).unwrap(),
            max_cloud_pct: 20.0,
        }
    }

    #[test]
    fn test_filter_dates_inclusive() {
        let filter = season_filter();
        let fp = [-2.5, 7.0, -2.0, 7.5];
        assert!(filter.matches(&meta("a", "2023-04-01", 5.0, fp)));
        assert!(filter.matches(&meta("b", "2023-07-31", 5.0, fp)));
        assert!(!filter.matches(&meta("c", "2023-03-31", 5.0, fp)));
        assert!(!filter.matches(&meta("d", "2023-08-01", 5.0, fp)));
    }

    #[test]
    fn test_filter_cloud_strictly_less() {
        let filter = season_filter();
        let fp = [-2.5, 7.0, -2.0, 7.5];
        assert!(filter.matches(&meta("a", "2023-05-01", 19.99, fp)));
        assert!(!filter.matches(&meta("b", "2023-05-01", 20.0, fp)));
    }

    #[test]
    fn test_filter_footprint() {
        let filter = season_filter();
        assert!(!filter.matches(&meta("far", "2023-05-01", 1.0, [10.0, 10.0, 11.0, 11.0])));
        assert!(filter.matches(&meta("edge", "2023-05-01", 1.0, [-1.5, 8.5, -1.0, 9.0])));
    }

    #[test]
    fn test_scene_consistency() {
        let grid = PixelGrid::from_bounds([0.0, 0.0, 2.0, 2.0], "EPSG:4326".to_string(), 1.0);
        let scene = Scene {
            meta: meta("s", "2023-05-01", 1.0, [0.0, 0.0, 2.0, 2.0]),
            window: grid.full_chunk(),
            band_names: vec!["B4".to_string(), "B8".to_string()],
            bands: Array3::zeros((2, 2, 2)),
            qa: Array2::zeros((2, 2)),
        };
        assert!(scene.check_consistent(&grid).is_ok());
        assert_eq!(scene.band("B8").unwrap().dim(), (2, 2));
        assert!(scene.band("B2").is_none());

        let smaller = PixelGrid::from_bounds([0.0, 0.0, 1.0, 2.0], "EPSG:4326".to_string(), 1.0);
        assert!(scene.check_consistent(&smaller).is_err());

        let mut wrong_window = scene.clone();
        wrong_window.window = grid.chunk(0, 0, 1);
        assert!(wrong_window.check_consistent(&grid).is_err());
    }

    #[test]
    fn test_scene_slice() {
        let grid = PixelGrid::from_bounds([0.0, 0.0, 5.0, 4.0], "EPSG:4326".to_string(), 1.0);
        let scene = Scene {
            meta: meta("s", "2023-05-01", 1.0, [0.0, 0.0, 5.0, 4.0]),
            window: grid.full_chunk(),
            band_names: vec!["B4".to_string()],
            bands: Array3::from_shape_fn((1, 4, 5), |(_, r, c)| (r * 10 + c) as u16),
            qa: Array2::from_shape_fn((4, 5), |(r, c)| (r * 10 + c) as u16),
        };

        let window = grid.chunk(1, 1, 3);
        let part = scene.slice(&window).unwrap();
        assert_eq!(part.window, window);
        assert_eq!(part.shape(), (1, 2));
        assert_eq!(part.bands[[0, 0, 0]], 33);
        assert_eq!(part.qa[[0, 1]], 34);
        assert!(part.check_consistent(&grid).is_ok());

        let beyond = GridChunk {
            row_idx: 0,
            col_idx: 0,
            row: 2,
            col: 2,
            height: 3,
            width: 3,
        };
        assert!(scene.slice(&beyond).is_err());
    }

    #[test]
    fn test_footprint_overlap() {
        let scene = meta("s", "2023-05-01", 1.0, [-3.0, 6.5, -2.0, 7.5]);
        assert!(scene.overlaps(&[-2.5, 7.0, -1.5, 8.0]));
        assert!(!scene.overlaps(&[-2.0, 6.5, -1.5, 7.5]));
    }
}
