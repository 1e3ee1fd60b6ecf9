//! Stratified point sampling and training table assembly.

mod features;
mod sampler;
mod table;

pub use features::extract_features;
pub use sampler::{merge_reservoirs, sample_class, ClassReservoir, ClassSample, StratifiedSampler};
pub use table::{SamplePoint, TrainingRow, TrainingTable};
