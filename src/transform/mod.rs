//! Raster transformations: cloud masking, median compositing, spectral index
//! and thresholding.

mod cloud_mask;
mod composite;
mod index;
mod threshold;

pub use cloud_mask::{mask_scenes, CloudMask, MaskedScene};
pub use composite::{composite_scenes, Composite, MedianAccumulator};
pub use index::{check_defined, compute_ndvi, normalized_difference, IndexImage};
pub use threshold::{ClassLabel, ClassMasks, Thresholds};
