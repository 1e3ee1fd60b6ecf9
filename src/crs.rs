//! Coordinate reference systems.
//!
//! Two CRS are in play. The region and scene footprints are WGS84 lon/lat;
//! the analysis grid and exported point geometry use the grid CRS (UTM 30N
//! by default). Bounds are always `[min_x, min_y, max_x, max_y]`, which for
//! WGS84 reads `[min_lon, min_lat, max_lon, max_lat]`.
//!
//! `Proj` handles are not `Send`; everything here runs on the calling thread.
//! Blocking tasks reach a per-thread cache through [`with_thread_cache`].

/// CRS codes used by the pipeline.
pub mod codes {
    /// WGS84 geographic (lon/lat in degrees).
    pub const WGS84: &str = "EPSG:4326";

    /// UTM zone 30N, covering central Ghana.
    pub const UTM_30N: &str = "EPSG:32630";
}

use anyhow::{Context, Result};
use proj::Proj;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Bounds in a specific CRS: [min_x, min_y, max_x, max_y]
pub type Bounds = [f64; 4];

/// Per-thread cache of `Proj` transformations keyed by (source, target).
#[derive(Default)]
pub struct ProjCache {
    cache: RefCell<HashMap<(String, String), Rc<Proj>>>,
}

impl ProjCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transformation between two CRS, created on first use.
    pub fn get(&self, from_crs: &str, to_crs: &str) -> Result<Rc<Proj>> {
        let key = (from_crs.to_string(), to_crs.to_string());
        if let Some(proj) = self.cache.borrow().get(&key) {
            return Ok(proj.clone());
        }

        let proj = Rc::new(
            Proj::new_known_crs(from_crs, to_crs, None)
                .with_context(|| format!("Failed to create projection from {} to {}", from_crs, to_crs))?,
        );
        self.cache.borrow_mut().insert(key, proj.clone());
        Ok(proj)
    }
}

thread_local! {
    static THREAD_CACHE: ProjCache = ProjCache::new();
}

/// Run `f` with the current thread's projection cache.
pub fn with_thread_cache<R>(f: impl FnOnce(&ProjCache) -> R) -> R {
    THREAD_CACHE.with(f)
}

/// Transform points in place.
pub fn transform_points(points: &mut [(f64, f64)], from_crs: &str, to_crs: &str, cache: &ProjCache) -> Result<()> {
    if from_crs == to_crs || points.is_empty() {
        return Ok(());
    }

    let count = points.len();
    let proj = cache.get(from_crs, to_crs)?;
    proj.convert_array(points)
        .with_context(|| format!("Failed to transform {} points from {} to {}", count, from_crs, to_crs))?;
    Ok(())
}

/// Points along the boundary of a rectangle, `segments` per edge.
fn boundary_points(bounds: &Bounds, segments: usize) -> Vec<(f64, f64)> {
    let segments = segments.max(1);
    let [min_x, min_y, max_x, max_y] = *bounds;

    (0..=segments)
        .flat_map(|i| {
            let t = i as f64 / segments as f64;
            let x = min_x + t * (max_x - min_x);
            let y = min_y + t * (max_y - min_y);
            [(x, min_y), (x, max_y), (min_x, y), (max_x, y)]
        })
        .collect()
}

/// Project a rectangle and return the bounding box of its densified boundary.
///
/// Projected edges curve, so corners alone can miss part of the region.
pub fn project_bounds(bounds: &Bounds, from_crs: &str, to_crs: &str, cache: &ProjCache, segments: usize) -> Result<Bounds> {
    if from_crs == to_crs {
        return Ok(*bounds);
    }

    let mut points = boundary_points(bounds, segments);
    transform_points(&mut points, from_crs, to_crs, cache)?;

    Ok(points.iter().fold(
        [f64::MAX, f64::MAX, f64::MIN, f64::MIN],
        |[min_x, min_y, max_x, max_y], &(x, y)| [min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y)],
    ))
}

/// Intersection of two bounds; `None` when they only touch or are disjoint.
pub fn intersect_bounds(a: &Bounds, b: &Bounds) -> Option<Bounds> {
    let overlap = [a[0].max(b[0]), a[1].max(b[1]), a[2].min(b[2]), a[3].min(b[3])];
    (overlap[0] < overlap[2] && overlap[1] < overlap[3]).then_some(overlap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_skips_proj() {
        let cache = ProjCache::new();
        let bounds = [-3.0, 6.5, -1.5, 8.5];
        assert_eq!(project_bounds(&bounds, codes::WGS84, codes::WGS84, &cache, 10).unwrap(), bounds);

        let mut points = vec![(-2.0, 7.0)];
        transform_points(&mut points, codes::WGS84, codes::WGS84, &cache).unwrap();
        assert_eq!(points, vec![(-2.0, 7.0)]);
        assert!(cache.cache.borrow().is_empty());
    }

    #[test]
    fn test_boundary_points_cover_edges() {
        let points = boundary_points(&[0.0, 0.0, 2.0, 1.0], 2);
        assert_eq!(points.len(), 12);
        assert!(points.contains(&(1.0, 0.0)));
        assert!(points.contains(&(2.0, 0.5)));
        assert!(points.iter().all(|&(x, y)| (0.0..=2.0).contains(&x) && (0.0..=1.0).contains(&y)));
    }

    #[test]
    fn test_project_region_to_utm_30n() {
        let cache = ProjCache::new();
        let result = project_bounds(&[-3.0, 6.5, -1.5, 8.5], codes::WGS84, codes::UTM_30N, &cache, 10).unwrap();

        // Zone 30's central meridian is -3°, so the region starts near 500 km easting
        assert!(result[0] > 450_000.0 && result[0] < 560_000.0, "min_x {}", result[0]);
        assert!(result[2] > result[0]);
        // 6.5°N is roughly 718 km north of the equator
        assert!(result[1] > 700_000.0 && result[1] < 740_000.0, "min_y {}", result[1]);
        assert!(result[3] > result[1]);
    }

    #[test]
    fn test_transform_points_round_trip() {
        let cache = ProjCache::new();
        let mut points = vec![(-2.0, 7.0), (-1.6, 8.4)];
        transform_points(&mut points, codes::WGS84, codes::UTM_30N, &cache).unwrap();
        assert!(points[0].0 > 100_000.0);
        transform_points(&mut points, codes::UTM_30N, codes::WGS84, &cache).unwrap();
        assert!((points[0].0 - -2.0).abs() < 1e-6 && (points[0].1 - 7.0).abs() < 1e-6);
        assert!((points[1].0 - -1.6).abs() < 1e-6);
    }

    #[test]
    fn test_thread_cache_reuses_projection() {
        let first = with_thread_cache(|cache| cache.get(codes::WGS84, codes::UTM_30N).unwrap());
        let second = with_thread_cache(|cache| cache.get(codes::WGS84, codes::UTM_30N).unwrap());
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_intersect_bounds() {
        let a = [0.0, 0.0, 2.0, 2.0];
        assert_eq!(intersect_bounds(&a, &[1.0, 1.0, 3.0, 3.0]), Some([1.0, 1.0, 2.0, 2.0]));
        assert_eq!(intersect_bounds(&a, &[3.0, 3.0, 4.0, 4.0]), None);
        // Touching edges do not overlap
        assert_eq!(intersect_bounds(&a, &[2.0, 0.0, 3.0, 1.0]), None);
    }
}
