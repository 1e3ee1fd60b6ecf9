//! Crop Sampler CLI
//!
//! Labels crop / non-crop training points from a cloud-masked Sentinel-2
//! composite and exports them as a table.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crop_sampler::{
    analysis_grid, build_runtime, generate_demo, init_rayon, open_archive, run_pipeline, Config, PipelineConfig,
    SceneArchive,
};

#[derive(Parser)]
#[command(name = "crop-sampler")]
#[command(about = "Sample labeled crop / non-crop training points from Sentinel-2 composites", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of points sampled per class
    #[arg(long, global = true)]
    points_per_class: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the labeling pipeline (default if no command specified)
    Run,

    /// List the scenes the collection filter selects, without processing
    Analyze,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Write a synthetic scene archive and a configuration that runs against it
    GenerateDemo {
        /// Directory receiving the archive, exports and config.yaml
        #[arg(short, long, default_value = "demo")]
        output: PathBuf,

        /// Analysis grid resolution for the demo (grid CRS units)
        #[arg(long, default_value_t = 1000.0)]
        resolution: f64,

        /// Seed for the synthetic reflectance noise
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, cli.points_per_class)?;
        }

        Some(Commands::Analyze) => {
            analyze_command(cli.config)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }

        Some(Commands::GenerateDemo {
            output,
            resolution,
            seed,
        }) => {
            generate_demo_command(output, resolution, seed)?;
        }
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, points_per_class: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;

    // Apply overrides
    if let Some(points) = points_per_class {
        config.sampling.points_per_class = points;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, points_per_class: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, points_per_class)?;

    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async {
        tokio::select! {
            result = run_pipeline(config) => {
                let report = result?;
                println!("{}", report);
                Ok(())
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted; nothing was exported");
                anyhow::bail!("Interrupted")
            }
        }
    })
}

fn analyze_command(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path, None)?;
    let settings = PipelineConfig::from_config(&config);
    let runtime = build_runtime(None)?;

    let scenes = runtime.block_on(async {
        let archive = open_archive(&config).await?;
        archive.query(&settings.filter).await
    })?;
    let grid = analysis_grid(&config)?;

    println!("\n=== Collection ===");
    println!("Filter: {}", settings.filter);
    println!("Scenes: {}", scenes.len());
    for scene in &scenes {
        println!(
            "  {:<32} {}  cloud {:>5.1}%  covers {:>5.1}% of region",
            scene.scene_id,
            scene.acquired,
            scene.cloud_pct,
            settings.filter.region.coverage(&scene.footprint_wgs84) * 100.0
        );
    }

    println!("\n=== Analysis Grid ===");
    println!("CRS: {}", grid.crs);
    println!("Grid: {}x{} pixels at {}", grid.width, grid.height, grid.resolution);

    let chunk_size = settings.chunk_size.max(1);
    let (chunk_rows, chunk_cols) = grid.chunk_counts(chunk_size);
    println!(
        "Chunks: {} ({}x{}) of {}x{} px, {} in flight",
        chunk_rows * chunk_cols,
        chunk_cols,
        chunk_rows,
        chunk_size,
        chunk_size,
        settings.chunk_concurrency
    );

    // Per chunk: raw u16 bands plus QA while loading, f32 composite
    // observations for every scene until the median
    let mb = |bytes: usize| bytes as f64 / (1024.0 * 1024.0);
    let chunk_pixels = chunk_size * chunk_size;
    let raw_window = chunk_pixels * (settings.bands.len() + 1) * 2;
    let observations = chunk_pixels * settings.bands.len() * 4 * scenes.len();
    println!("\n=== Size Estimates ===");
    println!(
        "Scene read: {:.1} MB per window, {:.1} MB total",
        mb(raw_window),
        mb(grid.num_pixels() * (settings.bands.len() + 1) * 2 * scenes.len())
    );
    println!(
        "Peak per chunk: {:.1} MB raw windows, {:.1} MB composite observations; x{} in flight",
        mb(raw_window * scenes.len()),
        mb(observations),
        settings.chunk_concurrency
    );
    println!(
        "Points requested: {} per class, up to {} rows",
        settings.sampler.points_per_class,
        settings.sampler.points_per_class * 2
    );
    println!("==================\n");

    if scenes.is_empty() {
        tracing::warn!("No scenes match the filter; a run would fail");
    }

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    load_config(&config_path, None)?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_demo_command(output: PathBuf, resolution: f64, seed: u64) -> Result<()> {
    let mut base = Config::default();
    base.study_area.resolution = resolution;
    base.validate()?;

    let dir = output.to_string_lossy().to_string();
    let runtime = build_runtime(None)?;
    let config = runtime.block_on(generate_demo(&base, &dir, seed))?;

    let config_path = output.join("config.yaml");
    std::fs::write(&config_path, config.to_yaml()?)?;
    println!("Generated demo archive in {}", output.display());
    println!("Run it with: crop-sampler --config {}", config_path.display());

    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Crop Sampler Configuration

# === INPUT: Where to read scenes from ===
input:
  # Parquet scene catalog (local path or s3:// URI)
  # Columns: scene_id, location, acquired, cloud_pct, min_lon, min_lat, max_lon, max_lat
  catalog_path: "archive/catalog.parquet"

  # Root of the per-scene Zarr groups (local directory or s3:// URI)
  scene_root: "archive"

  # Read S3 inputs without credentials (public buckets)
  anonymous: false
  s3_region: "us-west-2"

# === STUDY AREA: Region, season and analysis grid ===
study_area:
  # Bounding box in WGS84 [min_lon, min_lat, max_lon, max_lat]
  # Default: Brong Ahafo, Ghana
  region: [-3.0, 6.5, -1.5, 8.5]

  # Capture date range, inclusive on both ends
  start_date: "2023-04-01"
  end_date: "2023-07-31"

  # Scenes must report strictly less cloud than this percentage
  max_cloud_pct: 20.0

  # Analysis grid - UTM zone 30N at 10 m
  grid_crs: "EPSG:32630"
  resolution: 10.0

# === MASKING: QA cloud mask and composite bands ===
masking:
  # QA60 bits: 10 = opaque cloud, 11 = cirrus
  cloud_bit: 10
  cirrus_bit: 11

  # Digital number -> reflectance divisor
  scale_factor: 10000.0

  # Raw value outside the scene footprint (null = none)
  nodata_value: 0

  # Composite bands, in output column order
  bands: ["B2", "B3", "B4", "B8", "B11", "B12"]

# === LABELING: NDVI thresholds ===
# NDVI between the thresholds is left unlabeled
labeling:
  nir_band: "B8"
  red_band: "B4"
  positive_threshold: 0.4   # crop: NDVI > 0.4
  negative_threshold: 0.2   # non-crop: NDVI < 0.2

# === SAMPLING: Stratified random points ===
sampling:
  points_per_class: 300
  positive_seed: 2
  negative_seed: 1

  # Must equal study_area.resolution
  scale: 10.0

# === EXPORT: Where to write the training table ===
# Choose ONE of: local_path (local disk) OR bucket+prefix (S3)
export:
  # Option 1: Write to local filesystem
  local_path: "exports"

  # Option 2: Write to S3 (comment out local_path and uncomment these)
  # bucket: "training-data"
  # prefix: "ghana"

  folder: "GEE_Exports"
  file_name_prefix: "BrongAhafo_TrainData_2023"
  description: "BrongAhafo_TrainingData_Export"

  # csv or geojson
  format: csv

# === PROCESSING: Performance tuning ===
processing:
  # Grid chunk edge in pixels; also the Zarr tile size for generate-demo
  chunk_size: 512

  # Max chunks processed concurrently
  chunk_concurrency: 4

  # Max concurrent scene window loads per chunk
  load_concurrency: 8

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Rayon thread pool size for masking and compositing (null = num CPUs)
  # rayon_threads: 8

  # Zstd level for scenes written by generate-demo (0-22)
  compression_level: 3

  # Save final metrics / run report as JSON
  # metrics_output_path: "metrics.json"
  # report_output_path: "report.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["crop-sampler"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["crop-sampler", "-c", "other.yaml"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_points_override() {
        let cli = Cli::try_parse_from(["crop-sampler", "run", "--points-per-class", "50"]).unwrap();
        assert_eq!(cli.points_per_class, Some(50));
        assert!(matches!(cli.command, Some(Commands::Run)));
    }

    #[test]
    fn test_cli_parse_generate_demo() {
        let cli = Cli::try_parse_from(["crop-sampler", "generate-demo", "-o", "/tmp/demo", "--resolution", "500"]).unwrap();
        match cli.command {
            Some(Commands::GenerateDemo { output, resolution, seed }) => {
                assert_eq!(output, PathBuf::from("/tmp/demo"));
                assert_eq!(resolution, 500.0);
                assert_eq!(seed, 7);
            }
            _ => panic!("expected generate-demo"),
        }
    }

    #[test]
    fn test_generated_config_is_valid() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.points_per_class, 300);
    }

    #[test]
    fn test_load_config_applies_override() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = load_config(&path, Some(25)).unwrap();
        assert_eq!(config.sampling.points_per_class, 25);
    }
}
