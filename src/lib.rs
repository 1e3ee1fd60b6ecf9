//! Crop Sampler
//!
//! Builds a labeled crop / non-crop training table from a Sentinel-2 scene
//! archive: cloud-masked median composite, NDVI thresholding, seeded
//! stratified sampling, and export of the sampled band values.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Archive**: Parquet scene catalog with R-tree footprint queries, tiled per-scene Zarr arrays
//! - **Transform**: QA cloud masking, median compositing, NDVI and class thresholds
//! - **Sampling**: Stratified point sampling and feature extraction
//! - **I/O**: Object stores and CSV/GeoJSON export
//! - **Pipeline**: Per-chunk stage orchestration with metrics and a run report
//!
//! # Usage
//!
//! ```no_run
//! use crop_sampler::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_pipeline(config).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod crs;
pub mod error;
pub mod grid;
pub mod io;
pub mod pipeline;
pub mod region;
pub mod sampling;
pub mod transform;

pub use archive::{CatalogArchive, CollectionFilter, MemoryArchive, SceneArchive, SceneCatalog, SceneMeta, SceneStore};
pub use config::Config;
pub use error::{PipelineError, SampleShortfall};
pub use grid::PixelGrid;
pub use io::{ExportDestination, ExportSink, MemorySink, ObjectStoreSink, TableFormat};
pub use pipeline::{Metrics, Pipeline, PipelineConfig, PipelineReport};
pub use region::Region;
pub use sampling::{TrainingRow, TrainingTable};

use anyhow::Result;
use archive::synthetic::{self, SyntheticCollection};
use crs::ProjCache;

/// Open the scene archive named by the input configuration.
pub async fn open_archive(config: &Config) -> Result<CatalogArchive> {
    let input = &config.input;
    let access = io::S3Access::new(input.anonymous, &input.s3_region);

    tracing::info!("Loading scene catalog from {}", input.catalog_path);
    let catalog = match io::Location::parse(&input.catalog_path)? {
        io::Location::Local(path) => SceneCatalog::from_local_parquet(&path.to_string_lossy())?,
        location => {
            let store = location.open(&access)?;
            let path = object_store::path::Path::from(location.prefix());
            SceneCatalog::from_store(store, &path).await?
        }
    };
    tracing::info!("Loaded {} scenes", catalog.len());

    let scene_root = io::Location::parse(&input.scene_root)?;
    let scenes = SceneStore::new(scene_root.open(&access)?, scene_root.prefix());
    Ok(CatalogArchive::new(catalog, scenes))
}

/// Open the export sink named by the export configuration.
pub fn open_sink(config: &Config) -> Result<ObjectStoreSink> {
    let location = config.export.location()?;
    tracing::info!("Exporting to: {}", location);
    Ok(ObjectStoreSink::new(location.open(&io::S3Access::FromEnv)?, location.prefix()))
}

/// Run the full labeling pipeline with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<PipelineReport> {
    config.validate()?;

    tracing::info!("Starting crop sampling pipeline");

    let archive = open_archive(&config).await?;
    let sink = open_sink(&config)?;
    let pipeline = Pipeline::new(archive, sink, Metrics::new(), PipelineConfig::from_config(&config));

    let report = pipeline.run().await?;

    report.metrics.print_summary();
    if let Some(path) = &config.processing.metrics_output_path {
        report.metrics.save_to_file(path)?;
    }
    if let Some(path) = &config.processing.report_output_path {
        report.save_to_file(path)?;
    }

    Ok(report)
}

/// Analysis grid for the configured study area.
pub fn analysis_grid(config: &Config) -> Result<PixelGrid> {
    let cache = ProjCache::new();
    let area = &config.study_area;
    PixelGrid::for_region(&area.region, &area.grid_crs, area.resolution, &cache)
}

/// Write a synthetic scene archive for the configured season under
/// `output_dir`, and return a configuration that runs against it.
///
/// Scenes are written in tiles of `processing.chunk_size` pixels. The
/// returned configuration keeps every setting of `base` except the input
/// locations, the export directory and the sampling scale, which follows
/// the grid resolution.
pub async fn generate_demo(base: &Config, output_dir: &str, seed: u64) -> Result<Config> {
    let mut config = base.clone();
    config.sampling.scale = config.study_area.resolution;

    let grid = analysis_grid(&config)?;
    let area = &config.study_area;
    let collection = SyntheticCollection::new(grid, area.region.bounds(), seed);
    let recipes = collection.season_recipes(area.start_date, area.end_date);

    let store = io::create_local_store(output_dir)?;
    synthetic::write_archive(
        store,
        "",
        &collection,
        &recipes,
        config.processing.chunk_size,
        config.processing.compression_level,
    )
    .await?;

    let root = output_dir.trim_end_matches('/');
    config.input.catalog_path = format!("{}/{}", root, synthetic::CATALOG_FILE);
    config.input.scene_root = root.to_string();
    config.input.anonymous = false;
    config.export.local_path = Some(format!("{}/exports", root));
    config.export.bucket = None;
    config.export.prefix = None;

    Ok(config)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn demo_base() -> Config {
        let mut config = Config::default();
        config.study_area.grid_crs = crs::codes::WGS84.to_string();
        config.study_area.resolution = 0.02;
        config.sampling.points_per_class = 100;
        config.processing.chunk_size = 32;
        config
    }

    #[tokio::test]
    async fn test_demo_archive_runs_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("demo");
        let config = generate_demo(&demo_base(), dir.to_str().unwrap(), 11).await.unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.scale, 0.02);

        let report = run_pipeline(config.clone()).await.unwrap();
        assert_eq!(report.scenes.len(), 7);
        assert_eq!(report.chunk_size, 32);
        assert!(report.chunks_processed > 1);
        assert_eq!(report.positive_points, 100);
        assert_eq!(report.negative_points, 100);

        let written = dir.join("exports/GEE_Exports/BrongAhafo_TrainData_2023.csv");
        let text = std::fs::read_to_string(written).unwrap();
        assert_eq!(text.lines().count(), 201);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let mut config = demo_base();
        config.sampling.negative_seed = config.sampling.positive_seed;
        let err = run_pipeline(config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_catalog_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = demo_base();
        config.input.catalog_path = temp_dir.path().join("missing.parquet").to_str().unwrap().to_string();
        config.input.scene_root = temp_dir.path().to_str().unwrap().to_string();
        assert!(open_archive(&config).await.is_err());
    }
}
