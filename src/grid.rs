//! Analysis pixel grid.
//!
//! Every raster in the pipeline (masked scenes, composite, index, class
//! masks) is aligned to one `PixelGrid`. Sampling and feature extraction use
//! its resolution, so the two always agree.
//!
//! The grid is processed in square [`GridChunk`]s; no stage holds more than
//! one chunk's worth of pixels per scene.

use crate::crs::{self, Bounds, ProjCache};
use crate::region::Region;
use anyhow::Result;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Number of points sampled along each region edge when projecting it.
const EDGE_SAMPLES: usize = 10;

/// Pixel grid definition in the grid CRS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelGrid {
    /// Bounding box in grid CRS [min_x, min_y, max_x, max_y]
    pub bounds: Bounds,

    /// Grid CRS (e.g., "EPSG:32630")
    pub crs: String,

    /// Pixel size in grid CRS units
    pub resolution: f64,

    /// Height in pixels
    pub height: usize,

    /// Width in pixels
    pub width: usize,
}

impl PixelGrid {
    /// Create a grid covering the region, projected into `crs`.
    ///
    /// Dimensions are rounded up so the grid always covers the whole region;
    /// the max edges are expanded to the pixel-aligned extent.
    pub fn for_region(region: &Region, crs: &str, resolution: f64, cache: &ProjCache) -> Result<Self> {
        if !(resolution > 0.0) {
            anyhow::bail!("Grid resolution must be > 0, got {}", resolution);
        }

        let bounds = crs::project_bounds(
            &region.bounds(),
            crs::codes::WGS84,
            crs,
            cache,
            EDGE_SAMPLES,
        )?;

        let grid = Self::from_bounds(bounds, crs.to_string(), resolution);

        tracing::info!(
            "Analysis grid: WGS84 {} -> {} [{:.1}, {:.1}, {:.1}, {:.1}], {}x{} pixels at {}",
            region,
            crs,
            grid.bounds[0],
            grid.bounds[1],
            grid.bounds[2],
            grid.bounds[3],
            grid.width,
            grid.height,
            resolution
        );

        Ok(grid)
    }

    /// Create a grid from bounds already in the grid CRS.
    pub fn from_bounds(bounds: Bounds, crs: String, resolution: f64) -> Self {
        // Tolerance keeps exact multiples (e.g. 1.5 / 0.01) from gaining a pixel
        let width = (((bounds[2] - bounds[0]) / resolution - 1e-9).ceil() as usize).max(1);
        let height = (((bounds[3] - bounds[1]) / resolution - 1e-9).ceil() as usize).max(1);

        let bounds = [
            bounds[0],
            bounds[1],
            bounds[0] + width as f64 * resolution,
            bounds[1] + height as f64 * resolution,
        ];

        Self {
            bounds,
            crs,
            resolution,
            height,
            width,
        }
    }

    /// Shape as (rows, cols).
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Total number of pixels.
    pub fn num_pixels(&self) -> usize {
        self.height * self.width
    }

    /// Affine transform `[a, b, c, d, e, f]` mapping (col, row) to the top-left corner.
    pub fn geo_transform(&self) -> [f64; 6] {
        [self.resolution, 0.0, self.bounds[0], 0.0, -self.resolution, self.bounds[3]]
    }

    /// Whether another grid describes the same pixels (within 1% of a pixel).
    pub fn is_aligned_with(&self, other: &PixelGrid) -> bool {
        let tol = self.resolution * 0.01;
        self.crs == other.crs
            && self.shape() == other.shape()
            && (self.resolution - other.resolution).abs() <= tol
            && self
                .bounds
                .iter()
                .zip(other.bounds.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
    }

    /// Convert pixel coordinates to grid CRS coordinates (center of pixel).
    ///
    /// Uses top-down convention: row 0 is at max_y (top), increasing southward.
    pub fn pixel_to_crs(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.bounds[0] + (col as f64 + 0.5) * self.resolution;
        let y = self.bounds[3] - (row as f64 + 0.5) * self.resolution;
        (x, y)
    }

    /// Convert grid CRS coordinates to pixel coordinates.
    ///
    /// Returns None for points outside the grid. Points on the max edges
    /// belong to no pixel.
    pub fn crs_to_pixel(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let col = (x - self.bounds[0]) / self.resolution;
        let row = (self.bounds[3] - y) / self.resolution;
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row.floor() as usize, col.floor() as usize);
        if row >= self.height || col >= self.width {
            return None;
        }
        Some((row, col))
    }

    /// The whole grid as one chunk.
    pub fn full_chunk(&self) -> GridChunk {
        GridChunk {
            row_idx: 0,
            col_idx: 0,
            row: 0,
            col: 0,
            height: self.height,
            width: self.width,
        }
    }

    /// Number of chunks as (rows, cols) for square chunks of `chunk_size` pixels.
    pub fn chunk_counts(&self, chunk_size: usize) -> (usize, usize) {
        let size = chunk_size.max(1);
        (self.height.div_ceil(size), self.width.div_ceil(size))
    }

    /// Total number of chunks.
    pub fn num_chunks(&self, chunk_size: usize) -> usize {
        let (rows, cols) = self.chunk_counts(chunk_size);
        rows * cols
    }

    /// Chunk at the given chunk indices; edge chunks are clipped to the grid.
    pub fn chunk(&self, row_idx: usize, col_idx: usize, chunk_size: usize) -> GridChunk {
        let size = chunk_size.max(1);
        let row = (row_idx * size).min(self.height);
        let col = (col_idx * size).min(self.width);
        GridChunk {
            row_idx,
            col_idx,
            row,
            col,
            height: size.min(self.height - row),
            width: size.min(self.width - col),
        }
    }

    /// Enumerate chunks in row-major order.
    pub fn enumerate_chunks(&self, chunk_size: usize) -> impl Iterator<Item = GridChunk> + '_ {
        let (rows, cols) = self.chunk_counts(chunk_size);
        (0..rows).flat_map(move |row_idx| (0..cols).map(move |col_idx| self.chunk(row_idx, col_idx, chunk_size)))
    }

    /// Bounds of a chunk in grid CRS.
    ///
    /// Uses top-down convention: chunk row 0 is at the top (max_y).
    pub fn chunk_bounds(&self, chunk: &GridChunk) -> Bounds {
        let min_x = self.bounds[0] + chunk.col as f64 * self.resolution;
        let max_y = self.bounds[3] - chunk.row as f64 * self.resolution;
        [
            min_x,
            max_y - chunk.height as f64 * self.resolution,
            min_x + chunk.width as f64 * self.resolution,
            max_y,
        ]
    }

    /// Bounds of a chunk in WGS84.
    pub fn chunk_bounds_wgs84(&self, chunk: &GridChunk, cache: &ProjCache) -> Result<Bounds> {
        crs::project_bounds(&self.chunk_bounds(chunk), &self.crs, crs::codes::WGS84, cache, EDGE_SAMPLES)
    }

    /// Pixels of a chunk whose centre lies inside the region.
    ///
    /// Chunks entirely inside or entirely outside the region skip the
    /// per-pixel transform.
    pub fn region_mask(&self, region: &Region, chunk: &GridChunk, cache: &ProjCache) -> Result<Array2<bool>> {
        let wgs84 = self.chunk_bounds_wgs84(chunk, cache)?;
        if region.contains_bounds(&wgs84) {
            return Ok(Array2::from_elem(chunk.shape(), true));
        }
        if !region.intersects(&wgs84) {
            return Ok(Array2::from_elem(chunk.shape(), false));
        }

        let mut centres: Vec<(f64, f64)> = (0..chunk.height)
            .flat_map(|row| (0..chunk.width).map(move |col| (row, col)))
            .map(|(row, col)| self.pixel_to_crs(chunk.row + row, chunk.col + col))
            .collect();
        crs::transform_points(&mut centres, &self.crs, crs::codes::WGS84, cache)?;

        let inside: Vec<bool> = centres.iter().map(|&(lon, lat)| region.contains(lon, lat)).collect();
        let mask = Array2::from_shape_vec(chunk.shape(), inside)?;

        tracing::debug!(
            "Region mask of chunk ({}, {}): {}/{} pixels inside",
            chunk.row_idx,
            chunk.col_idx,
            mask.iter().filter(|&&v| v).count(),
            chunk.num_pixels()
        );

        Ok(mask)
    }
}

/// A rectangular window of the analysis grid, processed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridChunk {
    /// Row index in the chunk layout
    pub row_idx: usize,

    /// Column index in the chunk layout
    pub col_idx: usize,

    /// First grid row covered
    pub row: usize,

    /// First grid column covered
    pub col: usize,

    pub height: usize,

    pub width: usize,
}

impl GridChunk {
    /// Shape as (rows, cols).
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn num_pixels(&self) -> usize {
        self.height * self.width
    }

    /// Pixel bounds [start_row, start_col, end_row, end_col].
    pub fn pixel_bounds(&self) -> [usize; 4] {
        [self.row, self.col, self.row + self.height, self.col + self.width]
    }

    /// Chunk-local position of a grid pixel, if the chunk holds it.
    pub fn local(&self, row: usize, col: usize) -> Option<(usize, usize)> {
        let [start_row, start_col, end_row, end_col] = self.pixel_bounds();
        (row >= start_row && row < end_row && col >= start_col && col < end_col)
            .then(|| (row - start_row, col - start_col))
    }
}
