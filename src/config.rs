//! Configuration for the crop sampling pipeline.

use crate::error::PipelineError;
use crate::io::{ExportDestination, Location, TableFormat};
use crate::region::{Region, BRONG_AHAFO};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scene archive location
    #[serde(default)]
    pub input: InputConfig,

    /// Region, season and analysis grid
    #[serde(default)]
    pub study_area: StudyAreaConfig,

    /// Cloud masking and composite bands
    #[serde(default)]
    pub masking: MaskingConfig,

    /// NDVI class thresholds
    #[serde(default)]
    pub labeling: LabelingConfig,

    /// Stratified sampling
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Training table export
    #[serde(default)]
    pub export: ExportConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Scene archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Parquet scene catalog (local path or s3:// URI)
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    /// Root of the per-scene Zarr groups (local directory or s3:// URI)
    #[serde(default = "default_scene_root")]
    pub scene_root: String,

    /// Read S3 inputs without credentials (public buckets)
    #[serde(default)]
    pub anonymous: bool,

    /// Region of the input bucket
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
            scene_root: default_scene_root(),
            anonymous: false,
            s3_region: default_s3_region(),
        }
    }
}

/// Region, season and analysis grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyAreaConfig {
    /// Bounding box in WGS84 [min_lon, min_lat, max_lon, max_lat]
    #[serde(default = "default_region")]
    pub region: Region,

    /// First capture date (inclusive)
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,

    /// Last capture date (inclusive)
    #[serde(default = "default_end_date")]
    pub end_date: NaiveDate,

    /// Scenes must report strictly less cloud than this percentage
    #[serde(default = "default_max_cloud_pct")]
    pub max_cloud_pct: f64,

    /// Analysis grid CRS (default: UTM zone 30N)
    #[serde(default = "default_grid_crs")]
    pub grid_crs: String,

    /// Analysis grid pixel size in grid CRS units
    #[serde(default = "default_resolution")]
    pub resolution: f64,
}

impl Default for StudyAreaConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            start_date: default_start_date(),
            end_date: default_end_date(),
            max_cloud_pct: default_max_cloud_pct(),
            grid_crs: default_grid_crs(),
            resolution: default_resolution(),
        }
    }
}

/// Cloud masking and composite bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskingConfig {
    /// QA bit flagging opaque cloud
    #[serde(default = "default_cloud_bit")]
    pub cloud_bit: u8,

    /// QA bit flagging cirrus
    #[serde(default = "default_cirrus_bit")]
    pub cirrus_bit: u8,

    /// Divisor from digital numbers to reflectance
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,

    /// Raw value marking pixels outside the scene footprint (null = none)
    #[serde(default = "default_nodata_value")]
    pub nodata_value: Option<u16>,

    /// Composite bands, in output column order
    #[serde(default = "default_bands")]
    pub bands: Vec<String>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            cloud_bit: default_cloud_bit(),
            cirrus_bit: default_cirrus_bit(),
            scale_factor: default_scale_factor(),
            nodata_value: default_nodata_value(),
            bands: default_bands(),
        }
    }
}

/// NDVI class thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelingConfig {
    #[serde(default = "default_nir_band")]
    pub nir_band: String,

    #[serde(default = "default_red_band")]
    pub red_band: String,

    /// Pixels with NDVI strictly above are labeled 1
    #[serde(default = "default_positive_threshold")]
    pub positive_threshold: f32,

    /// Pixels with NDVI strictly below are labeled 0
    #[serde(default = "default_negative_threshold")]
    pub negative_threshold: f32,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            nir_band: default_nir_band(),
            red_band: default_red_band(),
            positive_threshold: default_positive_threshold(),
            negative_threshold: default_negative_threshold(),
        }
    }
}

/// Stratified sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_points_per_class")]
    pub points_per_class: usize,

    #[serde(default = "default_positive_seed")]
    pub positive_seed: u64,

    #[serde(default = "default_negative_seed")]
    pub negative_seed: u64,

    /// Sampling scale; must equal the grid resolution
    #[serde(default = "default_resolution")]
    pub scale: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            points_per_class: default_points_per_class(),
            positive_seed: default_positive_seed(),
            negative_seed: default_negative_seed(),
            scale: default_resolution(),
        }
    }
}

/// Training table export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Local directory receiving exports.
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// Export S3 bucket (required if local_path is not set)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Export S3 path prefix (required if local_path is not set)
    #[serde(default)]
    pub prefix: Option<String>,

    /// Folder under the export root
    #[serde(default = "default_folder")]
    pub folder: String,

    /// File name without extension
    #[serde(default = "default_file_name_prefix")]
    pub file_name_prefix: String,

    /// Task description used in logs
    #[serde(default = "default_description")]
    pub description: String,

    #[serde(default = "default_format")]
    pub format: TableFormat,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            local_path: Some(default_local_export_path()),
            bucket: None,
            prefix: None,
            folder: default_folder(),
            file_name_prefix: default_file_name_prefix(),
            description: default_description(),
            format: default_format(),
        }
    }
}

impl ExportConfig {
    /// Export root: the local directory, or the S3 bucket and prefix.
    pub fn location(&self) -> anyhow::Result<Location> {
        match (&self.local_path, &self.bucket) {
            (Some(path), _) => Ok(Location::Local(path.into())),
            (None, Some(bucket)) => Ok(Location::S3 {
                bucket: bucket.clone(),
                prefix: self.prefix.as_deref().unwrap_or("").trim_matches('/').to_string(),
            }),
            (None, None) => anyhow::bail!("export.bucket required when local_path is not set"),
        }
    }

    /// Destination of the training table inside the export root.
    pub fn destination(&self) -> ExportDestination {
        ExportDestination {
            description: self.description.clone(),
            folder: self.folder.clone(),
            file_name_prefix: self.file_name_prefix.clone(),
            format: self.format,
        }
    }
}

/// Processing and runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Edge length of the square grid chunks processed as one unit, in pixels.
    /// Also the Zarr tile size of scenes written by `generate-demo`.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum chunks in flight
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,

    /// Maximum scene window loads in flight per chunk
    #[serde(default = "default_load_concurrency")]
    pub load_concurrency: usize,

    /// Tokio worker threads (default: num CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon threads for masking and compositing (default: num CPUs)
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// zstd level for scene arrays written by `generate-demo`
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Path to save final metrics as JSON (optional)
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    /// Path to save the run report as JSON (optional)
    #[serde(default)]
    pub report_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_concurrency: default_chunk_concurrency(),
            load_concurrency: default_load_concurrency(),
            worker_threads: None,
            rayon_threads: None,
            compression_level: default_compression_level(),
            metrics_output_path: None,
            report_output_path: None,
        }
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    PipelineError::InvalidConfig(message.into()).into()
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // YAML is a superset of JSON
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    ///
    /// Failures are `PipelineError::InvalidConfig` wrapped in `anyhow`.
    pub fn validate(&self) -> anyhow::Result<()> {
        let export = &self.export;
        match (&export.local_path, &export.bucket, &export.prefix) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(invalid("Cannot specify both export.local_path and export bucket/prefix"));
            }
            (None, None, _) | (None, _, None) => {
                return Err(invalid("Must specify either export.local_path or both export.bucket and export.prefix"));
            }
            _ => {}
        }
        if export.file_name_prefix.trim().is_empty() {
            return Err(invalid("export.file_name_prefix must not be empty"));
        }

        let area = &self.study_area;
        if area.start_date > area.end_date {
            return Err(invalid(format!(
                "start_date {} is after end_date {}",
                area.start_date, area.end_date
            )));
        }
        if !(area.max_cloud_pct > 0.0 && area.max_cloud_pct <= 100.0) {
            return Err(invalid(format!("max_cloud_pct must be in (0, 100], got {}", area.max_cloud_pct)));
        }
        if area.grid_crs.trim().is_empty() {
            return Err(invalid("grid_crs must not be empty"));
        }
        if !(area.resolution > 0.0) {
            return Err(invalid(format!("resolution must be > 0, got {}", area.resolution)));
        }

        let masking = &self.masking;
        for (name, bit) in [("cloud_bit", masking.cloud_bit), ("cirrus_bit", masking.cirrus_bit)] {
            if bit >= 16 {
                return Err(invalid(format!("{} must be < 16 for a 16-bit QA band, got {}", name, bit)));
            }
        }
        if masking.cloud_bit == masking.cirrus_bit {
            return Err(invalid("cloud_bit and cirrus_bit must differ"));
        }
        if !(masking.scale_factor > 0.0) {
            return Err(invalid(format!("scale_factor must be > 0, got {}", masking.scale_factor)));
        }
        if masking.bands.is_empty() {
            return Err(invalid("masking.bands must not be empty"));
        }
        for (i, band) in masking.bands.iter().enumerate() {
            if masking.bands[..i].contains(band) {
                return Err(invalid(format!("band {} is listed twice", band)));
            }
        }

        let labeling = &self.labeling;
        for band in [&labeling.nir_band, &labeling.red_band] {
            if !masking.bands.contains(band) {
                return Err(invalid(format!("index band {} is not among the composite bands", band)));
            }
        }
        if !labeling.positive_threshold.is_finite() || !labeling.negative_threshold.is_finite() {
            return Err(invalid("thresholds must be finite"));
        }
        if labeling.positive_threshold < labeling.negative_threshold {
            return Err(invalid(format!(
                "positive_threshold {} is below negative_threshold {}; classes would overlap",
                labeling.positive_threshold, labeling.negative_threshold
            )));
        }

        let sampling = &self.sampling;
        if sampling.points_per_class == 0 {
            return Err(invalid("points_per_class must be > 0"));
        }
        if sampling.positive_seed == sampling.negative_seed {
            return Err(invalid("positive_seed and negative_seed must differ"));
        }
        if !(sampling.scale > 0.0) {
            return Err(invalid(format!("sampling scale must be > 0, got {}", sampling.scale)));
        }

        if self.processing.chunk_size == 0 {
            return Err(invalid("chunk_size must be > 0"));
        }
        if self.processing.chunk_concurrency == 0 {
            return Err(invalid("chunk_concurrency must be > 0"));
        }
        if self.processing.load_concurrency == 0 {
            return Err(invalid("load_concurrency must be > 0"));
        }
        if self.processing.compression_level < 0 || self.processing.compression_level > 22 {
            return Err(invalid("Compression level must be 0-22 for zstd"));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_catalog_path() -> String { "archive/catalog.parquet".to_string() }
fn default_scene_root() -> String { "archive".to_string() }
fn default_s3_region() -> String { "us-west-2".to_string() }
fn default_region() -> Region { BRONG_AHAFO }
fn default_start_date() -> NaiveDate { NaiveDate::from_ymd_opt(2023, 4, 1).unwrap_or(NaiveDate::MIN) }
fn default_end_date() -> NaiveDate { NaiveDate::from_ymd_opt(2023, 7, 31).unwrap_or(NaiveDate::MIN) }
fn default_max_cloud_pct() -> f64 { 20.0 }
fn default_grid_crs() -> String { crate::crs::codes::UTM_30N.to_string() }
fn default_resolution() -> f64 { 10.0 }
fn default_cloud_bit() -> u8 { 10 }
fn default_cirrus_bit() -> u8 { 11 }
fn default_scale_factor() -> f32 { 10_000.0 }
fn default_nodata_value() -> Option<u16> { Some(0) }
fn default_bands() -> Vec<String> {
    ["B2", "B3", "B4", "B8", "B11", "B12"].iter().map(|b| b.to_string()).collect()
}
fn default_nir_band() -> String { "B8".to_string() }
fn default_red_band() -> String { "B4".to_string() }
fn default_positive_threshold() -> f32 { 0.4 }
fn default_negative_threshold() -> f32 { 0.2 }
fn default_points_per_class() -> usize { 300 }
fn default_positive_seed() -> u64 { 2 }
fn default_negative_seed() -> u64 { 1 }
fn default_local_export_path() -> String { "exports".to_string() }
fn default_folder() -> String { "GEE_Exports".to_string() }
fn default_file_name_prefix() -> String { "BrongAhafo_TrainData_2023".to_string() }
fn default_description() -> String { "BrongAhafo_TrainingData_Export".to_string() }
fn default_format() -> TableFormat { TableFormat::Csv }
fn default_chunk_size() -> usize { 512 }
fn default_chunk_concurrency() -> usize { 4 }
fn default_load_concurrency() -> usize { 8 }
fn default_compression_level() -> i32 { 3 }
