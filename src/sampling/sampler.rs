//! Seeded stratified sampling of class masks.
//!
//! Sampling runs one grid chunk at a time. Every candidate pixel draws a
//! random key from a generator seeded by the class seed and the chunk
//! position; each class keeps the `points_per_class` smallest keys. Chunk
//! reservoirs merge in any order to the same result, which is a uniform
//! draw without replacement over all candidates of the run.

use super::{extract_features, SamplePoint, TrainingRow};
use crate::error::{PipelineError, Result, SampleShortfall};
use crate::grid::{GridChunk, PixelGrid};
use crate::transform::{ClassLabel, ClassMasks, Composite};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Rows drawn from one class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassSample {
    pub class: ClassLabel,

    /// Rows in row-major pixel order
    pub rows: Vec<TrainingRow>,

    /// Set when the class held fewer candidates than requested
    pub shortfall: Option<SampleShortfall>,
}

/// A candidate pixel with its sampling key.
#[derive(Debug, Clone)]
struct Candidate {
    key: u64,

    point: SamplePoint,

    /// Band values, attached once the chunk composite is known
    values: Vec<Option<f32>>,
}

impl Candidate {
    fn order_key(&self) -> (u64, usize, usize) {
        (self.key, self.point.row, self.point.col)
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// The `capacity` smallest-key candidates seen so far for one class.
#[derive(Debug, Clone)]
pub struct ClassReservoir {
    class: ClassLabel,

    capacity: usize,

    /// Candidates offered, kept or not
    available: usize,

    /// Max-heap on key, so the worst kept candidate is on top
    kept: BinaryHeap<Candidate>,
}

impl ClassReservoir {
    pub fn new(class: ClassLabel, capacity: usize) -> Self {
        Self {
            class,
            capacity,
            available: 0,
            kept: BinaryHeap::new(),
        }
    }

    pub fn class(&self) -> ClassLabel {
        self.class
    }

    /// Number of candidate pixels offered.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Number of candidates currently kept.
    pub fn len(&self) -> usize {
        self.kept.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }

    fn offer(&mut self, candidate: Candidate) {
        self.available += 1;
        self.insert(candidate);
    }

    fn insert(&mut self, candidate: Candidate) {
        if self.kept.len() < self.capacity {
            self.kept.push(candidate);
            return;
        }
        if let Some(mut worst) = self.kept.peek_mut() {
            if candidate < *worst {
                *worst = candidate;
            }
        }
    }

    /// Fold another reservoir of the same class into this one.
    pub fn merge(&mut self, other: ClassReservoir) {
        debug_assert_eq!(self.class, other.class);
        self.available += other.available;
        for candidate in other.kept {
            self.insert(candidate);
        }
    }

    /// Attach composite band values to every kept candidate.
    pub fn attach_features(&mut self, composite: &Composite, grid: &PixelGrid, scale: f64) -> Result<()> {
        let mut kept = std::mem::take(&mut self.kept).into_vec();
        let points: Vec<SamplePoint> = kept.iter().map(|c| c.point.clone()).collect();
        let values = extract_features(&points, composite, grid, scale)?;
        for (candidate, values) in kept.iter_mut().zip(values) {
            candidate.values = values;
        }
        self.kept = BinaryHeap::from(kept);
        Ok(())
    }

    /// Final rows in row-major pixel order, with ids and any shortfall.
    pub fn finish(self) -> ClassSample {
        let class = self.class;
        let mut kept = self.kept.into_vec();
        kept.sort_unstable_by_key(|c| (c.point.row, c.point.col));

        let rows: Vec<TrainingRow> = kept
            .into_iter()
            .enumerate()
            .map(|(n, candidate)| TrainingRow {
                id: format!("{}_{}", class, n),
                class,
                x: candidate.point.x,
                y: candidate.point.y,
                values: candidate.values,
            })
            .collect();

        let shortfall = (self.capacity > self.available).then(|| SampleShortfall {
            class,
            requested: self.capacity,
            available: self.available,
        });
        if let Some(shortfall) = &shortfall {
            tracing::warn!("{}", shortfall);
        }

        tracing::info!(
            "Sampled {} of {} candidate pixels for class {}",
            rows.len(),
            self.available,
            class
        );

        ClassSample { class, rows, shortfall }
    }
}

/// Draws up to `points_per_class` pixel centres from each class mask.
#[derive(Debug, Clone, PartialEq)]
pub struct StratifiedSampler {
    pub points_per_class: usize,

    pub positive_seed: u64,

    pub negative_seed: u64,

    /// Sampling scale in grid CRS units; must equal the grid resolution
    pub scale: f64,
}

impl StratifiedSampler {
    pub fn seed(&self, class: ClassLabel) -> u64 {
        match class {
            ClassLabel::Positive => self.positive_seed,
            ClassLabel::Negative => self.negative_seed,
        }
    }

    pub fn check_scale(&self, grid: &PixelGrid) -> Result<()> {
        check_scale(self.scale, grid)
    }

    /// Empty reservoirs, positive first.
    pub fn reservoirs(&self) -> Vec<ClassReservoir> {
        [ClassLabel::Positive, ClassLabel::Negative]
            .into_iter()
            .map(|class| ClassReservoir::new(class, self.points_per_class))
            .collect()
    }

    /// Sample both classes over one window. Masks are window-local.
    pub fn sample_chunk(
        &self,
        masks: &ClassMasks,
        region_mask: &Array2<bool>,
        window: &GridChunk,
        grid: &PixelGrid,
    ) -> Result<Vec<ClassReservoir>> {
        self.check_scale(grid)?;
        [ClassLabel::Positive, ClassLabel::Negative]
            .into_iter()
            .map(|class| {
                sample_class(
                    masks.mask(class),
                    region_mask,
                    window,
                    grid,
                    class,
                    self.points_per_class,
                    self.seed(class),
                )
            })
            .collect()
    }
}

/// Fold per-chunk reservoirs into the running ones, matched by class.
pub fn merge_reservoirs(into: &mut [ClassReservoir], from: Vec<ClassReservoir>) {
    for reservoir in from {
        if let Some(target) = into.iter_mut().find(|r| r.class == reservoir.class) {
            target.merge(reservoir);
        }
    }
}

/// Check the sampling scale against the grid resolution.
pub(crate) fn check_scale(scale: f64, grid: &PixelGrid) -> Result<()> {
    if (scale - grid.resolution).abs() > grid.resolution * 1e-9 {
        return Err(PipelineError::ResolutionMismatch {
            expected: scale,
            actual: grid.resolution,
        });
    }
    Ok(())
}

/// Seed of a chunk's key generator.
fn chunk_seed(seed: u64, window: &GridChunk) -> u64 {
    let position = ((window.row_idx as u64) << 32) | window.col_idx as u64;
    seed.wrapping_add(position.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Offer every pixel of `window` where both `mask` and `region_mask` are true.
///
/// Both masks are window-local. Identical inputs always yield an identical
/// reservoir.
pub fn sample_class(
    mask: &Array2<bool>,
    region_mask: &Array2<bool>,
    window: &GridChunk,
    grid: &PixelGrid,
    class: ClassLabel,
    count: usize,
    seed: u64,
) -> Result<ClassReservoir> {
    for shape in [mask.dim(), region_mask.dim()] {
        if shape != window.shape() {
            return Err(PipelineError::ShapeMismatch {
                expected: window.shape(),
                actual: shape,
            });
        }
    }

    let mut rng = StdRng::seed_from_u64(chunk_seed(seed, window));
    let mut reservoir = ClassReservoir::new(class, count);

    for (((r, c), &in_class), &in_region) in mask.indexed_iter().zip(region_mask.iter()) {
        if !(in_class && in_region) {
            continue;
        }
        let (row, col) = (window.row + r, window.col + c);
        let (x, y) = grid.pixel_to_crs(row, col);
        reservoir.offer(Candidate {
            key: rng.gen(),
            point: SamplePoint { class, row, col, x, y },
            values: Vec::new(),
        });
    }

    tracing::debug!(
        "Chunk ({}, {}) class {}: {} candidates, {} kept",
        window.row_idx,
        window.col_idx,
        class,
        reservoir.available(),
        reservoir.len()
    );

    Ok(reservoir)
}
