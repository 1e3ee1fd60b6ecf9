//! Area of interest.

use crate::crs::{self, Bounds};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Rectangular area of interest in WGS84.
///
/// Used as the catalog footprint filter and as the clip boundary of the
/// composite and of both sampling strata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 4]", into = "[f64; 4]")]
pub struct Region {
    bounds: Bounds,
}

/// Brong Ahafo, Ghana.
pub const BRONG_AHAFO: Region = Region {
    bounds: [-3.0, 6.5, -1.5, 8.5],
};

impl Region {
    /// Create a region from `[min_lon, min_lat, max_lon, max_lat]`.
    pub fn new(bounds: Bounds) -> Result<Self> {
        let [min_lon, min_lat, max_lon, max_lat] = bounds;
        if bounds.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::InvalidConfig(format!(
                "region bounds must be finite, got {:?}",
                bounds
            )));
        }
        if min_lon >= max_lon || min_lat >= max_lat {
            return Err(PipelineError::InvalidConfig(format!(
                "region must have min < max on both axes, got {:?}",
                bounds
            )));
        }
        if min_lon < -180.0 || max_lon > 180.0 || min_lat < -90.0 || max_lat > 90.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "region is outside WGS84 range: {:?}",
                bounds
            )));
        }
        Ok(Self { bounds })
    }

    /// Bounds as `[min_lon, min_lat, max_lon, max_lat]`.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Whether a footprint overlaps the region (shared edges count).
    pub fn intersects(&self, footprint: &Bounds) -> bool {
        footprint[0] <= self.bounds[2]
            && footprint[2] >= self.bounds[0]
            && footprint[1] <= self.bounds[3]
            && footprint[3] >= self.bounds[1]
    }

    /// Whether a WGS84 point lies inside the region (edges inclusive).
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.bounds[0] && lon <= self.bounds[2] && lat >= self.bounds[1] && lat <= self.bounds[3]
    }

    /// Whether a WGS84 box lies entirely inside the region (edges inclusive).
    pub fn contains_bounds(&self, bounds: &Bounds) -> bool {
        self.contains(bounds[0], bounds[1]) && self.contains(bounds[2], bounds[3])
    }

    /// Overlap of a footprint with the region, if any.
    pub fn overlap(&self, footprint: &Bounds) -> Option<Bounds> {
        crs::intersect_bounds(&self.bounds, footprint)
    }

    /// Fraction of the region's lon/lat extent covered by a footprint.
    pub fn coverage(&self, footprint: &Bounds) -> f64 {
        let area = |b: &Bounds| (b[2] - b[0]) * (b[3] - b[1]);
        self.overlap(footprint).map_or(0.0, |o| area(&o) / area(&self.bounds))
    }
}

impl TryFrom<[f64; 4]> for Region {
    type Error = PipelineError;

    fn try_from(bounds: [f64; 4]) -> Result<Self> {
        Region::new(bounds)
    }
}

impl From<Region> for [f64; 4] {
    fn from(region: Region) -> Self {
        region.bounds
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:.4}, {:.4}, {:.4}, {:.4}]",
            self.bounds[0], self.bounds[1], self.bounds[2], self.bounds[3]
        )
    }
}
