//! Deterministic synthetic Sentinel-2 scenes.
//!
//! Vegetation cover rises from west to east across the grid, so a median
//! composite has NDVI spanning both class thresholds. Clouds are rectangles
//! flagged in the QA band with bright reflectance underneath.

use super::{Scene, SceneCatalog, SceneMeta, SceneStore};
use crate::grid::{GridChunk, PixelGrid};
use anyhow::Result;
use chrono::{Days, NaiveDate};
use ndarray::{Array2, Array3};
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Sentinel-2 bands generated for every scene.
pub const BANDS: [&str; 6] = ["B2", "B3", "B4", "B8", "B11", "B12"];

/// Digital numbers per unit reflectance.
const DN_SCALE: f64 = 10_000.0;

/// Half-width of the uniform reflectance noise.
const NOISE: f64 = 0.004;

const CLOUD_REFLECTANCE: f64 = 0.35;

const CLOUD_BIT: u16 = 1 << 10;
const CIRRUS_BIT: u16 = 1 << 11;

/// Catalog file name written next to the scene arrays.
pub const CATALOG_FILE: &str = "catalog.parquet";

/// A cloudy rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloudPatch {
    pub row: usize,
    pub col: usize,
    pub height: usize,
    pub width: usize,

    /// Flag as cirrus (bit 11) instead of opaque cloud (bit 10)
    pub cirrus: bool,
}

impl CloudPatch {
    fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.row && row < self.row + self.height && col >= self.col && col < self.col + self.width
    }
}

/// Surface reflectance of a band at vegetation fraction `v` in [0, 1].
fn reflectance(band: &str, v: f64) -> f64 {
    match band {
        "B2" => 0.06 - 0.02 * v,
        "B3" => 0.08,
        "B4" => 0.14 - 0.10 * v,
        "B8" => 0.14 + 0.36 * v,
        "B11" => 0.25 - 0.10 * v,
        "B12" => 0.18 - 0.10 * v,
        _ => 0.10,
    }
}

fn to_dn(reflectance: f64) -> u16 {
    // DN 0 is reserved for pixels outside the footprint
    (reflectance * DN_SCALE).round().clamp(1.0, u16::MAX as f64) as u16
}

/// Mixes a pixel position into a scene seed.
fn pixel_seed(scene_seed: u64, row: usize, col: usize) -> u64 {
    scene_seed ^ (((row as u64) << 32) | col as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Everything needed to render any window of a synthetic scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneRecipe {
    pub meta: SceneMeta,

    pub clouds: Vec<CloudPatch>,

    /// Columns inside the footprint; the rest is raw no-data (DN 0)
    pub covered_cols: usize,
}

/// Generates scenes on a fixed analysis grid.
///
/// Pixel values depend only on the scene and the pixel position, so a
/// window renders the same values as the matching part of the full scene.
#[derive(Debug, Clone)]
pub struct SyntheticCollection {
    grid: PixelGrid,

    /// Footprint reported for full scenes, WGS84
    footprint_wgs84: [f64; 4],

    seed: u64,
}

impl SyntheticCollection {
    pub fn new(grid: PixelGrid, footprint_wgs84: [f64; 4], seed: u64) -> Self {
        Self {
            grid,
            footprint_wgs84,
            seed,
        }
    }

    pub fn grid(&self) -> &PixelGrid {
        &self.grid
    }

    fn scene_seed(&self, scene_id: &str) -> u64 {
        scene_id
            .bytes()
            .fold(self.seed, |h, b| h.wrapping_mul(31).wrapping_add(b as u64))
    }

    /// Vegetation fraction of a column.
    fn vegetation(&self, col: usize) -> f64 {
        if self.grid.width <= 1 {
            0.0
        } else {
            col as f64 / (self.grid.width - 1) as f64
        }
    }

    /// Percentage of grid pixels flagged by the cloud patches.
    fn cloud_pct(&self, clouds: &[CloudPatch], covered_cols: usize) -> f64 {
        let (height, width) = self.grid.shape();
        let flagged: usize = (0..height)
            .map(|row| {
                let mut spans: Vec<(usize, usize)> = clouds
                    .iter()
                    .filter(|patch| row >= patch.row && row < patch.row + patch.height)
                    .map(|patch| (patch.col.min(covered_cols), (patch.col + patch.width).min(covered_cols)))
                    .filter(|(start, stop)| start < stop)
                    .collect();
                spans.sort_unstable();

                let (mut total, mut reached) = (0, 0);
                for (start, stop) in spans {
                    let start = start.max(reached);
                    if stop > start {
                        total += stop - start;
                    }
                    reached = reached.max(stop);
                }
                total
            })
            .sum();
        100.0 * flagged as f64 / (height * width).max(1) as f64
    }

    /// Recipe of a full-footprint scene with the given cloud patches.
    pub fn recipe(&self, scene_id: &str, acquired: NaiveDate, clouds: &[CloudPatch]) -> SceneRecipe {
        let covered_cols = self.grid.width;
        SceneRecipe {
            meta: SceneMeta {
                scene_id: scene_id.to_string(),
                location: format!("scenes/{}", scene_id),
                acquired,
                cloud_pct: self.cloud_pct(clouds, covered_cols),
                footprint_wgs84: self.footprint_wgs84,
            },
            clouds: clouds.to_vec(),
            covered_cols,
        }
    }

    /// Recipe of a cloud-free scene whose footprint ends after `covered_cols` columns.
    pub fn partial_recipe(&self, scene_id: &str, acquired: NaiveDate, covered_cols: usize) -> SceneRecipe {
        let covered_cols = covered_cols.min(self.grid.width);
        let mut recipe = self.recipe(scene_id, acquired, &[]);
        let [min_lon, min_lat, max_lon, max_lat] = self.footprint_wgs84;
        let fraction = covered_cols as f64 / self.grid.width.max(1) as f64;
        recipe.meta.footprint_wgs84 = [min_lon, min_lat, min_lon + (max_lon - min_lon) * fraction, max_lat];
        recipe.covered_cols = covered_cols;
        recipe
    }

    /// Render the part of a scene covered by `window`.
    pub fn render(&self, recipe: &SceneRecipe, window: &GridChunk) -> Scene {
        let scene_seed = self.scene_seed(&recipe.meta.scene_id);
        let mut qa = Array2::<u16>::zeros(window.shape());
        let mut bands = Array3::<u16>::zeros((BANDS.len(), window.height, window.width));

        for r in 0..window.height {
            let row = window.row + r;
            for c in 0..window.width {
                let col = window.col + c;
                if col >= recipe.covered_cols {
                    continue;
                }

                match recipe.clouds.iter().find(|patch| patch.contains(row, col)) {
                    Some(patch) => {
                        qa[[r, c]] = if patch.cirrus { CIRRUS_BIT } else { CLOUD_BIT };
                        for b in 0..BANDS.len() {
                            bands[[b, r, c]] = to_dn(CLOUD_REFLECTANCE);
                        }
                    }
                    None => {
                        let v = self.vegetation(col);
                        let mut rng = StdRng::seed_from_u64(pixel_seed(scene_seed, row, col));
                        for (b, band) in BANDS.iter().enumerate() {
                            bands[[b, r, c]] = to_dn(reflectance(band, v) + rng.gen_range(-NOISE..=NOISE));
                        }
                    }
                }
            }
        }

        Scene {
            meta: recipe.meta.clone(),
            window: *window,
            band_names: BANDS.iter().map(|b| b.to_string()).collect(),
            bands,
            qa,
        }
    }

    /// A full-footprint scene with the given cloud patches, over the whole grid.
    pub fn scene(&self, scene_id: &str, acquired: NaiveDate, clouds: &[CloudPatch]) -> Scene {
        self.render(&self.recipe(scene_id, acquired, clouds), &self.grid.full_chunk())
    }

    /// A scene whose footprint ends after `covered_cols` columns, over the whole grid.
    pub fn partial_scene(&self, scene_id: &str, acquired: NaiveDate, covered_cols: usize) -> Scene {
        self.render(&self.partial_recipe(scene_id, acquired, covered_cols), &self.grid.full_chunk())
    }

    /// Recipes for a season of scenes around `[start, end]`.
    ///
    /// Six in-season scenes with light cloud, one partial-footprint scene,
    /// and three that a filter for the season with a 20% ceiling rejects:
    /// one before `start`, one after `end`, one half covered by cloud.
    pub fn season_recipes(&self, start: NaiveDate, end: NaiveDate) -> Vec<SceneRecipe> {
        let (height, width) = self.grid.shape();
        let span = (end - start).num_days().max(0) as u64;
        let step = span / 6;

        let corner_cloud = CloudPatch {
            row: 0,
            col: 0,
            height: height / 4,
            width: width / 3,
            cirrus: false,
        };
        let cirrus_band = CloudPatch {
            row: height / 3,
            col: width / 2,
            height: height / 6,
            width: width / 4,
            cirrus: true,
        };
        let overcast = CloudPatch {
            row: 0,
            col: 0,
            height: height / 2,
            width,
            cirrus: false,
        };

        let id = |date: NaiveDate, n: usize| format!("S2_SYN_{}_{:02}", date.format("%Y%m%d"), n);

        let mut recipes: Vec<SceneRecipe> = (0..6u64)
            .map(|k| {
                let date = start + Days::new(k * step);
                let clouds: &[CloudPatch] = match k % 3 {
                    0 => &[],
                    1 => std::slice::from_ref(&corner_cloud),
                    _ => std::slice::from_ref(&cirrus_band),
                };
                self.recipe(&id(date, k as usize), date, clouds)
            })
            .collect();

        let mid = start + Days::new(span / 2);
        recipes.push(self.partial_recipe(&id(mid, 6), mid, width * 3 / 5));

        let early = start - Days::new(10);
        recipes.push(self.recipe(&id(early, 7), early, &[]));
        let late = end + Days::new(10);
        recipes.push(self.recipe(&id(late, 8), late, &[]));
        let cloudy = start + Days::new(step / 2);
        recipes.push(self.recipe(&id(cloudy, 9), cloudy, &[overcast]));

        recipes
    }

    /// A season of scenes over the whole grid; see [`Self::season_recipes`].
    pub fn season(&self, start: NaiveDate, end: NaiveDate) -> Vec<Scene> {
        let full = self.grid.full_chunk();
        self.season_recipes(start, end)
            .iter()
            .map(|recipe| self.render(recipe, &full))
            .collect()
    }
}

/// Write scenes and their catalog under `prefix`.
///
/// Scenes go to `<prefix>/<location>` as Zarr groups, rendered and written
/// one `tile_size` tile at a time, and the catalog to
/// `<prefix>/catalog.parquet`.
pub async fn write_archive(
    store: Arc<dyn ObjectStore>,
    prefix: &str,
    collection: &SyntheticCollection,
    recipes: &[SceneRecipe],
    tile_size: usize,
    compression_level: i32,
) -> Result<SceneCatalog> {
    let grid = collection.grid();
    let scene_store = SceneStore::new(store.clone(), prefix)
        .with_compression_level(compression_level)
        .with_tile_size(tile_size);

    for recipe in recipes {
        let arrays = scene_store.create_scene(&recipe.meta, &BANDS.map(String::from), grid).await?;
        for tile in grid.enumerate_chunks(tile_size) {
            arrays.write_window(&collection.render(recipe, &tile)).await?;
        }
    }

    let catalog = SceneCatalog::new(recipes.iter().map(|r| r.meta.clone()).collect());
    let prefix = prefix.trim_matches('/');
    let path = if prefix.is_empty() {
        Path::from(CATALOG_FILE)
    } else {
        Path::from(format!("{}/{}", prefix, CATALOG_FILE))
    };
    store.put(&path, PutPayload::from(catalog.to_parquet_bytes()?)).await?;

    tracing::info!(
        "Wrote {} synthetic scenes ({} tiles each) and catalog {}",
        recipes.len(),
        grid.num_chunks(tile_size),
        path
    );

    Ok(catalog)
}
