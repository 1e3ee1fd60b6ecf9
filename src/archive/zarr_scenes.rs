//! Per-scene Zarr arrays using zarrs.
//!
//! Each scene lives in its own group at `<prefix>/<location>` with two arrays:
//! `bands` (band, y, x) and `qa` (y, x), both `uint16` and zstd-compressed.
//! Arrays are tiled into square spatial chunks holding every band, so a
//! window read touches only the tiles it overlaps. The `bands` array carries
//! `bands`, `crs` and `transform` attributes describing the grid the scene
//! was written on.

use super::{Scene, SceneMeta};
use crate::grid::{GridChunk, PixelGrid};
use anyhow::{Context, Result};
use ndarray::{Array2, Array3};
use object_store::ObjectStore;
use std::sync::Arc;
use zarrs::array::codec::bytes_to_bytes::zstd::ZstdCodec;
use zarrs::array::{Array, ArrayBuilder, ArraySubset};
use zarrs::group::GroupBuilder;
use zarrs_object_store::AsyncObjectStore;

type ZarrStore = AsyncObjectStore<Arc<dyn ObjectStore>>;

/// Default tile edge in pixels.
pub const DEFAULT_TILE_SIZE: usize = 512;

/// Reads and writes scene arrays in an object store.
pub struct SceneStore {
    zarr_store: Arc<ZarrStore>,

    /// Path prefix inside the store ("" when the prefix is baked into the store)
    prefix: String,

    /// zstd compression level for written scenes
    compression_level: i32,

    /// Tile edge in pixels for written scenes
    tile_size: usize,
}

/// The opened band and QA arrays of one scene.
pub struct SceneArrays {
    scene_id: String,
    bands: Array<ZarrStore>,
    qa: Array<ZarrStore>,
}

impl SceneArrays {
    /// Write a scene window into the arrays.
    ///
    /// Windows aligned to the tile size replace whole tiles; others update
    /// the tiles they overlap.
    pub async fn write_window(&self, scene: &Scene) -> Result<()> {
        let [start_row, start_col, end_row, end_col] = scene.window.pixel_bounds();
        let (rows, cols) = (start_row as u64..end_row as u64, start_col as u64..end_col as u64);
        let num_bands = scene.bands.dim().0 as u64;

        let subset = ArraySubset::new_with_ranges(&[0..num_bands, rows.clone(), cols.clone()]);
        let elements: Vec<u16> = scene.bands.iter().copied().collect();
        self.bands
            .async_store_array_subset(&subset, elements)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write bands of {}: {:?}", self.scene_id, e))?;

        let subset = ArraySubset::new_with_ranges(&[rows, cols]);
        let elements: Vec<u16> = scene.qa.iter().copied().collect();
        self.qa
            .async_store_array_subset(&subset, elements)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write QA of {}: {:?}", self.scene_id, e))?;

        Ok(())
    }
}

impl SceneStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            zarr_store: Arc::new(AsyncObjectStore::new(store)),
            prefix: prefix.trim_matches('/').to_string(),
            compression_level: 3,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_tile_size(mut self, tile_size: usize) -> Self {
        self.tile_size = tile_size.max(1);
        self
    }

    /// Group path for a scene location (leading slash required by zarrs).
    fn group_path(&self, location: &str) -> String {
        let location = location.trim_matches('/');
        if self.prefix.is_empty() {
            format!("/{}", location)
        } else {
            format!("/{}/{}", self.prefix, location)
        }
    }

    /// Create a scene's group and empty arrays covering `grid`.
    pub async fn create_scene(&self, meta: &SceneMeta, band_names: &[String], grid: &PixelGrid) -> Result<SceneArrays> {
        let group_path = self.group_path(&meta.location);
        let group = GroupBuilder::new().build(self.zarr_store.clone(), &group_path)?;
        group.async_store_metadata().await?;

        let (height, width) = (grid.height as u64, grid.width as u64);
        let tile = self.tile_size as u64;
        let num_bands = band_names.len() as u64;

        let mut builder = ArrayBuilder::new(
            vec![num_bands, height, width],
            vec![num_bands, tile.min(height), tile.min(width)],
            "uint16",
            0u16,
        );
        builder.dimension_names(Some(vec![
            Some("band".to_string()),
            Some("y".to_string()),
            Some("x".to_string()),
        ]));
        builder.bytes_to_bytes_codecs(vec![Arc::new(ZstdCodec::new(self.compression_level, false))]);

        let mut attributes = serde_json::Map::new();
        attributes.insert("bands".to_string(), serde_json::json!(band_names));
        attributes.insert("crs".to_string(), serde_json::json!(grid.crs));
        attributes.insert("transform".to_string(), serde_json::json!(grid.geo_transform()));
        attributes.insert("scene_id".to_string(), serde_json::json!(meta.scene_id));
        builder.attributes(attributes);

        let bands = builder.build(self.zarr_store.clone(), &format!("{}/bands", group_path))?;
        bands.async_store_metadata().await?;

        let mut builder = ArrayBuilder::new(
            vec![height, width],
            vec![tile.min(height), tile.min(width)],
            "uint16",
            0u16,
        );
        builder.dimension_names(Some(vec![Some("y".to_string()), Some("x".to_string())]));
        builder.bytes_to_bytes_codecs(vec![Arc::new(ZstdCodec::new(self.compression_level, false))]);

        let qa = builder.build(self.zarr_store.clone(), &format!("{}/qa", group_path))?;
        qa.async_store_metadata().await?;

        tracing::debug!(
            "Created scene {} at {} ({} bands, {}x{}, {}px tiles)",
            meta.scene_id,
            group_path,
            num_bands,
            width,
            height,
            tile
        );

        Ok(SceneArrays {
            scene_id: meta.scene_id.clone(),
            bands,
            qa,
        })
    }

    /// Create a scene and write its window in one step.
    pub async fn write_scene(&self, scene: &Scene, grid: &PixelGrid) -> Result<()> {
        scene.check_consistent(grid)?;
        let arrays = self.create_scene(&scene.meta, &scene.band_names, grid).await?;
        arrays.write_window(scene).await
    }

    /// Open a scene's arrays and check they were written on `grid`.
    async fn open_scene(&self, meta: &SceneMeta, grid: &PixelGrid) -> Result<(SceneArrays, Vec<String>)> {
        let group_path = self.group_path(&meta.location);

        let bands_path = format!("{}/bands", group_path);
        let bands = Array::<ZarrStore>::async_open(self.zarr_store.clone(), &bands_path)
            .await
            .with_context(|| format!("Failed to open band array for scene {} at {}", meta.scene_id, bands_path))?;

        let attributes = bands.attributes();
        let band_names: Vec<String> = attributes
            .get("bands")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .with_context(|| format!("Scene {} has no 'bands' attribute", meta.scene_id))?;

        let crs = attributes.get("crs").and_then(|v| v.as_str()).unwrap_or_default();
        if crs != grid.crs {
            anyhow::bail!(
                "Scene {} is in {} but the analysis grid is {}",
                meta.scene_id,
                crs,
                grid.crs
            );
        }

        if let Some(transform) = attributes.get("transform") {
            let transform: [f64; 6] = serde_json::from_value(transform.clone())
                .with_context(|| format!("Scene {} has a malformed 'transform' attribute", meta.scene_id))?;
            let stored = PixelGrid::from_bounds(
                [
                    transform[2],
                    transform[5] - grid.height as f64 * transform[0],
                    transform[2] + grid.width as f64 * transform[0],
                    transform[5],
                ],
                crs.to_string(),
                transform[0],
            );
            if !stored.is_aligned_with(grid) {
                anyhow::bail!(
                    "Scene {} grid {:?} is not aligned with the analysis grid {:?}",
                    meta.scene_id,
                    stored.bounds,
                    grid.bounds
                );
            }
        }

        let expected = [band_names.len() as u64, grid.height as u64, grid.width as u64];
        if bands.shape() != expected.as_slice() {
            anyhow::bail!(
                "Scene {} band array has shape {:?}, expected {:?}",
                meta.scene_id,
                bands.shape(),
                expected
            );
        }

        let qa_path = format!("{}/qa", group_path);
        let qa = Array::<ZarrStore>::async_open(self.zarr_store.clone(), &qa_path)
            .await
            .with_context(|| format!("Failed to open QA array for scene {} at {}", meta.scene_id, qa_path))?;

        let arrays = SceneArrays {
            scene_id: meta.scene_id.clone(),
            bands,
            qa,
        };
        Ok((arrays, band_names))
    }

    /// Read the part of a scene covered by `window`.
    pub async fn read_window(&self, meta: &SceneMeta, grid: &PixelGrid, window: &GridChunk) -> Result<Scene> {
        let (arrays, band_names) = self.open_scene(meta, grid).await?;

        let [start_row, start_col, end_row, end_col] = window.pixel_bounds();
        let (rows, cols) = (start_row as u64..end_row as u64, start_col as u64..end_col as u64);
        let num_bands = band_names.len();

        let subset = ArraySubset::new_with_ranges(&[0..num_bands as u64, rows.clone(), cols.clone()]);
        let elements = arrays
            .bands
            .async_retrieve_array_subset::<Vec<u16>>(&subset)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read bands of {}: {:?}", meta.scene_id, e))?;
        let bands = Array3::from_shape_vec((num_bands, window.height, window.width), elements)?;

        let subset = ArraySubset::new_with_ranges(&[rows, cols]);
        let elements = arrays
            .qa
            .async_retrieve_array_subset::<Vec<u16>>(&subset)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read QA of {}: {:?}", meta.scene_id, e))?;
        let qa = Array2::from_shape_vec(window.shape(), elements)?;

        let scene = Scene {
            meta: meta.clone(),
            window: *window,
            band_names,
            bands,
            qa,
        };
        scene.check_consistent(grid)?;

        Ok(scene)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use object_store::local::LocalFileSystem;
    use tempfile::TempDir;

    fn test_grid() -> PixelGrid {
        PixelGrid::from_bounds([500_000.0, 700_000.0, 500_070.0, 700_050.0], "EPSG:32630".to_string(), 10.0)
    }

    fn test_scene(grid: &PixelGrid) -> Scene {
        let (height, width) = grid.shape();
        let bands = Array3::from_shape_fn((2, height, width), |(b, r, c)| (b * 1000 + r * 10 + c) as u16);
        let mut qa = Array2::zeros((height, width));
        qa[[1, 2]] = 1 << 10;
        qa[[4, 6]] = 1 << 11;
        Scene {
            meta: SceneMeta {
                scene_id: "S2A_20230512".to_string(),
                location: "scenes/S2A_20230512".to_string(),
                acquired: NaiveDate::from_ymd_opt(2023, 5, 12).unwrap(),
                cloud_pct: 4.5,
                footprint_wgs84: [-3.0, 6.3, -2.99, 6.31],
            },
            window: grid.full_chunk(),
            band_names: vec!["B4".to_string(), "B8".to_string()],
            bands,
            qa,
        }
    }

    fn local_store(temp_dir: &TempDir) -> Arc<dyn ObjectStore> {
        Arc::new(LocalFileSystem::new_with_prefix(temp_dir.path()).unwrap())
    }

    #[tokio::test]
    async fn test_write_then_read_scene() {
        let temp_dir = TempDir::new().unwrap();
        let scenes = SceneStore::new(local_store(&temp_dir), "");
        let grid = test_grid();
        let scene = test_scene(&grid);

        scenes.write_scene(&scene, &grid).await.unwrap();
        assert!(temp_dir.path().join("scenes/S2A_20230512/bands/zarr.json").exists());

        let read = scenes.read_window(&scene.meta, &grid, &grid.full_chunk()).await.unwrap();
        assert_eq!(read.band_names, scene.band_names);
        assert_eq!(read.bands, scene.bands);
        assert_eq!(read.qa[[1, 2]], 1 << 10);
        assert_eq!(read.meta, scene.meta);
    }

    #[tokio::test]
    async fn test_tiled_windows_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let scenes = SceneStore::new(local_store(&temp_dir), "").with_tile_size(3);
        let grid = test_grid();
        let scene = test_scene(&grid);

        // Written tile by tile, as the archive writer does
        let arrays = scenes.create_scene(&scene.meta, &scene.band_names, &grid).await.unwrap();
        for chunk in grid.enumerate_chunks(3) {
            arrays.write_window(&scene.slice(&chunk).unwrap()).await.unwrap();
        }

        // Read back through windows that straddle tile edges
        for window in grid.enumerate_chunks(4) {
            let read = scenes.read_window(&scene.meta, &grid, &window).await.unwrap();
            let expected = scene.slice(&window).unwrap();
            assert_eq!(read.window, window);
            assert_eq!(read.bands, expected.bands);
            assert_eq!(read.qa, expected.qa);
        }
    }

    #[tokio::test]
    async fn test_read_rejects_other_grid() {
        let temp_dir = TempDir::new().unwrap();
        let scenes = SceneStore::new(local_store(&temp_dir), "archive");
        let grid = test_grid();
        let scene = test_scene(&grid);
        scenes.write_scene(&scene, &grid).await.unwrap();

        let mut shifted = grid.clone();
        shifted.bounds[0] += 20.0;
        shifted.bounds[2] += 20.0;
        assert!(scenes.read_window(&scene.meta, &shifted, &shifted.full_chunk()).await.is_err());

        let mut other_crs = grid.clone();
        other_crs.crs = "EPSG:32631".to_string();
        assert!(scenes.read_window(&scene.meta, &other_crs, &other_crs.full_chunk()).await.is_err());
    }

    #[tokio::test]
    async fn test_read_missing_scene_fails() {
        let temp_dir = TempDir::new().unwrap();
        let scenes = SceneStore::new(local_store(&temp_dir), "");
        let grid = test_grid();
        let meta = test_scene(&grid).meta;
        assert!(scenes.read_window(&meta, &grid, &grid.full_chunk()).await.is_err());
    }
}
