//! The labeling pipeline: filter, mask, composite, index, threshold, sample,
//! extract and export, in that order.
//!
//! Everything between the query and the export runs one grid chunk at a
//! time: scene windows are loaded for the chunk, masked, composited, indexed,
//! thresholded and sampled, and only the chunk's class reservoirs and counts
//! outlive it.

use super::metrics::{Metrics, MetricsSnapshot, Stage};
use crate::archive::{CollectionFilter, Scene, SceneArchive, SceneMeta};
use crate::config::Config;
use crate::crs::{self, ProjCache};
use crate::error::{PipelineError, SampleShortfall};
use crate::grid::{GridChunk, PixelGrid};
use crate::io::{export_table, ExportDestination, ExportSink, ExportSummary};
use crate::sampling::{merge_reservoirs, ClassReservoir, ClassSample, StratifiedSampler, TrainingTable};
use crate::transform::{
    check_defined, compute_ndvi, composite_scenes, mask_scenes, ClassLabel, CloudMask, Thresholds,
};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Resolved settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub filter: CollectionFilter,

    /// Analysis grid CRS
    pub grid_crs: String,

    /// Analysis grid pixel size in grid CRS units
    pub resolution: f64,

    pub cloud_mask: CloudMask,

    /// Composite bands, in output column order
    pub bands: Vec<String>,

    pub nir_band: String,

    pub red_band: String,

    pub thresholds: Thresholds,

    pub sampler: StratifiedSampler,

    pub destination: ExportDestination,

    /// Edge length of square processing chunks, in pixels
    pub chunk_size: usize,

    /// Maximum chunks in flight
    pub chunk_concurrency: usize,

    /// Maximum scene window loads in flight per chunk
    pub load_concurrency: usize,
}

impl PipelineConfig {
    /// Resolve run settings from a validated configuration.
    pub fn from_config(config: &Config) -> Self {
        let area = &config.study_area;
        let masking = &config.masking;
        let labeling = &config.labeling;
        let sampling = &config.sampling;

        Self {
            filter: CollectionFilter {
                region: area.region,
                start: area.start_date,
                end: area.end_date,
                max_cloud_pct: area.max_cloud_pct,
            },
            grid_crs: area.grid_crs.clone(),
            resolution: area.resolution,
            cloud_mask: CloudMask {
                cloud_bit: masking.cloud_bit,
                cirrus_bit: masking.cirrus_bit,
                scale_factor: masking.scale_factor,
                nodata: masking.nodata_value,
            },
            bands: masking.bands.clone(),
            nir_band: labeling.nir_band.clone(),
            red_band: labeling.red_band.clone(),
            thresholds: Thresholds {
                positive_above: labeling.positive_threshold,
                negative_below: labeling.negative_threshold,
            },
            sampler: StratifiedSampler {
                points_per_class: sampling.points_per_class,
                positive_seed: sampling.positive_seed,
                negative_seed: sampling.negative_seed,
                scale: sampling.scale,
            },
            destination: config.export.destination(),
            chunk_size: config.processing.chunk_size,
            chunk_concurrency: config.processing.chunk_concurrency,
            load_concurrency: config.processing.load_concurrency,
        }
    }
}

/// What one processed chunk contributes to the run.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunk: GridChunk,

    /// Valid pixels per scene, keyed by position in the collection
    pub scene_valid_pixels: Vec<(usize, usize)>,

    pub composite_pixels: usize,

    pub index_pixels: usize,

    pub positive_candidates: usize,

    pub negative_candidates: usize,

    /// Class reservoirs with band values attached, positive first
    pub reservoirs: Vec<ClassReservoir>,
}

/// Result of processing one chunk.
#[derive(Debug)]
pub enum ChunkResult {
    Processed(ChunkOutcome),

    /// No pixel inside the region, or no scene overlapping the chunk
    Skipped,
}

/// Running totals over chunk outcomes. Folding is order-independent.
struct RunTotals {
    scene_valid_pixels: Vec<usize>,
    composite_pixels: usize,
    index_pixels: usize,
    positive_candidates: usize,
    negative_candidates: usize,
    reservoirs: Vec<ClassReservoir>,
    chunks_processed: usize,
    chunks_skipped: usize,
}

impl RunTotals {
    fn new(num_scenes: usize, sampler: &StratifiedSampler) -> Self {
        Self {
            scene_valid_pixels: vec![0; num_scenes],
            composite_pixels: 0,
            index_pixels: 0,
            positive_candidates: 0,
            negative_candidates: 0,
            reservoirs: sampler.reservoirs(),
            chunks_processed: 0,
            chunks_skipped: 0,
        }
    }

    fn add(&mut self, result: ChunkResult) {
        let outcome = match result {
            ChunkResult::Processed(outcome) => outcome,
            ChunkResult::Skipped => {
                self.chunks_skipped += 1;
                return;
            }
        };

        self.chunks_processed += 1;
        for (position, valid) in outcome.scene_valid_pixels {
            if let Some(total) = self.scene_valid_pixels.get_mut(position) {
                *total += valid;
            }
        }
        self.composite_pixels += outcome.composite_pixels;
        self.index_pixels += outcome.index_pixels;
        self.positive_candidates += outcome.positive_candidates;
        self.negative_candidates += outcome.negative_candidates;
        merge_reservoirs(&mut self.reservoirs, outcome.reservoirs);
    }
}

/// Per-scene line of the run report.
#[derive(Debug, Clone, Serialize)]
pub struct SceneSummary {
    pub scene_id: String,
    pub acquired: chrono::NaiveDate,
    pub cloud_pct: f64,

    /// Pixels that survived cloud masking
    pub valid_pixels: usize,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub grid: PixelGrid,

    /// Chunk layout of the run
    pub chunk_size: usize,
    pub chunks_processed: usize,
    pub chunks_skipped: usize,

    /// Scenes matching the filter, in collection order, with valid pixels summed over chunks
    pub scenes: Vec<SceneSummary>,

    /// Composite pixels with at least one valid observation
    pub composite_pixels: usize,

    /// Index pixels with a defined value
    pub index_pixels: usize,

    /// Candidate pixels per class before sampling
    pub positive_candidates: usize,
    pub negative_candidates: usize,

    pub positive_points: usize,
    pub negative_points: usize,

    /// Rows whose point fell on a no-data composite pixel
    pub nodata_rows: usize,

    pub shortfalls: Vec<SampleShortfall>,

    pub export: ExportSummary,

    pub metrics: MetricsSnapshot,

    /// The exported table
    #[serde(skip)]
    pub table: TrainingTable,
}

impl PipelineReport {
    /// Save the report (without the table) as JSON.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report to {}", path))?;
        tracing::info!("Run report saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} scenes, {} chunks ({} skipped), {} composite px, {} positive / {} negative points ({} no-data), {} shortfalls -> {} ({} bytes)",
            self.scenes.len(),
            self.chunks_processed + self.chunks_skipped,
            self.chunks_skipped,
            self.composite_pixels,
            self.positive_points,
            self.negative_points,
            self.nodata_rows,
            self.shortfalls.len(),
            self.export.path,
            self.export.bytes
        )
    }
}

/// Runs the labeling stages against an archive and an export sink.
pub struct Pipeline<A, S> {
    archive: A,
    sink: S,
    metrics: Arc<Metrics>,
    config: Arc<PipelineConfig>,
}

impl<A: SceneArchive, S: ExportSink> Pipeline<A, S> {
    pub fn new(archive: A, sink: S, metrics: Arc<Metrics>, config: PipelineConfig) -> Self {
        Self {
            archive,
            sink,
            metrics,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Query the collection. An empty collection is an error.
    pub async fn query(&self) -> Result<Vec<SceneMeta>> {
        let filter = &self.config.filter;
        let start = Instant::now();
        let scenes = self.archive.query(filter).await.context("Collection query failed")?;
        self.metrics.add_stage_time(Stage::Query, start.elapsed());
        self.metrics.set_scenes_matched(scenes.len() as u64);

        tracing::info!("Collection: {} scenes match {}", scenes.len(), filter);

        if scenes.is_empty() {
            return Err(PipelineError::EmptyCollection {
                filter: filter.to_string(),
            }
            .into());
        }
        Ok(scenes)
    }

    /// Analysis grid covering the region.
    ///
    /// Runs synchronously: `Proj` handles are not `Send`.
    pub fn analysis_grid(&self) -> Result<PixelGrid> {
        let cache = ProjCache::new();
        let region = &self.config.filter.region;
        PixelGrid::for_region(region, &self.config.grid_crs, self.config.resolution, &cache)
    }

    /// Load one window of each scene, preserving collection order.
    async fn load_windows(&self, metas: &[(usize, &SceneMeta)], grid: &PixelGrid, chunk: &GridChunk) -> Result<Vec<Scene>> {
        let start = Instant::now();
        let concurrency = self.config.load_concurrency.max(1);

        let scenes: Vec<Scene> = stream::iter(metas)
            .map(|&(_, meta)| async move {
                let scene = self.archive.load(meta, grid, chunk).await.with_context(|| {
                    format!(
                        "Failed to load scene {} for chunk ({}, {})",
                        meta.scene_id, chunk.row_idx, chunk.col_idx
                    )
                })?;
                let bytes = (scene.bands.len() + scene.qa.len()) * std::mem::size_of::<u16>();
                self.metrics.add_window_loaded(bytes as u64);
                Ok::<_, anyhow::Error>(scene)
            })
            .buffered(concurrency)
            .try_collect()
            .await?;

        self.metrics.add_stage_time(Stage::Load, start.elapsed());
        Ok(scenes)
    }

    /// Mask, composite, index, threshold and sample one chunk.
    pub async fn process_chunk(&self, metas: &[SceneMeta], grid: &Arc<PixelGrid>, chunk: GridChunk) -> Result<ChunkResult> {
        // Region mask and WGS84 bounds; Proj handles stay on the blocking thread
        let region = self.config.filter.region;
        let mask_grid = grid.clone();
        let (region_mask, bounds_wgs84) = tokio::task::spawn_blocking(move || {
            crs::with_thread_cache(|cache| -> Result<_> {
                let region_mask = mask_grid.region_mask(&region, &chunk, cache)?;
                let bounds = mask_grid.chunk_bounds_wgs84(&chunk, cache)?;
                Ok((region_mask, bounds))
            })
        })
        .await
        .context("Region mask task panicked")??;

        if !region_mask.iter().any(|&inside| inside) {
            self.metrics.add_chunk_skipped();
            return Ok(ChunkResult::Skipped);
        }

        let overlapping: Vec<(usize, &SceneMeta)> = metas
            .iter()
            .enumerate()
            .filter(|(_, meta)| meta.overlaps(&bounds_wgs84))
            .collect();
        if overlapping.is_empty() {
            tracing::debug!("Chunk ({}, {}): no overlapping scenes", chunk.row_idx, chunk.col_idx);
            self.metrics.add_chunk_skipped();
            return Ok(ChunkResult::Skipped);
        }

        let positions: Vec<usize> = overlapping.iter().map(|&(position, _)| position).collect();
        let scenes = self.load_windows(&overlapping, grid, &chunk).await?;

        // CPU-bound stages on the rayon pool
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let grid = grid.clone();
        let outcome = tokio::task::spawn_blocking(move || -> Result<ChunkOutcome> {
            let mask_start = Instant::now();
            let masked = mask_scenes(scenes, &config.cloud_mask);
            metrics.add_stage_time(Stage::Mask, mask_start.elapsed());

            let scene_valid_pixels: Vec<(usize, usize)> =
                positions.iter().zip(&masked).map(|(&position, scene)| (position, scene.valid_pixels)).collect();
            let observations: usize = scene_valid_pixels.iter().map(|&(_, valid)| valid).sum();
            metrics.add_valid_observations(observations as u64);

            let composite_start = Instant::now();
            let composite = composite_scenes(masked, &config.bands, &chunk, &region_mask)?;
            metrics.add_stage_time(Stage::Composite, composite_start.elapsed());

            let index_start = Instant::now();
            let ndvi = compute_ndvi(&composite, &config.nir_band, &config.red_band)?;
            let masks = config.thresholds.apply(&ndvi);
            metrics.add_stage_time(Stage::Index, index_start.elapsed());

            let sample_start = Instant::now();
            let mut reservoirs = config.sampler.sample_chunk(&masks, &region_mask, &chunk, &grid)?;
            metrics.add_stage_time(Stage::Sample, sample_start.elapsed());

            let extract_start = Instant::now();
            for reservoir in &mut reservoirs {
                reservoir.attach_features(&composite, &grid, config.sampler.scale)?;
            }
            metrics.add_stage_time(Stage::Extract, extract_start.elapsed());

            Ok(ChunkOutcome {
                chunk,
                scene_valid_pixels,
                composite_pixels: composite.valid_pixels(),
                index_pixels: ndvi.valid_count(),
                positive_candidates: masks.count(ClassLabel::Positive),
                negative_candidates: masks.count(ClassLabel::Negative),
                reservoirs,
            })
        })
        .await
        .context("Chunk processing task panicked")??;

        tracing::debug!(
            "Chunk ({}, {}): {} scenes, {} composite px, {} / {} candidates",
            chunk.row_idx,
            chunk.col_idx,
            outcome.scene_valid_pixels.len(),
            outcome.composite_pixels,
            outcome.positive_candidates,
            outcome.negative_candidates
        );

        self.metrics.add_composite_pixels(outcome.composite_pixels as u64);
        self.metrics.add_chunk_processed();
        Ok(ChunkResult::Processed(outcome))
    }

    /// Execute all stages and export the training table.
    pub async fn run(&self) -> Result<PipelineReport> {
        let config = &self.config;

        let metas = self.query().await?;
        let grid = Arc::new(self.analysis_grid()?);
        config.sampler.check_scale(&grid)?;

        let chunk_size = config.chunk_size.max(1);
        let concurrency = config.chunk_concurrency.max(1);
        tracing::info!(
            "Scheduling {} chunks of {}x{} px over a {}x{} grid ({} concurrent)",
            grid.num_chunks(chunk_size),
            chunk_size,
            chunk_size,
            grid.width,
            grid.height,
            concurrency
        );

        // Fold outcomes as they complete so finished chunks are released
        let mut totals = RunTotals::new(metas.len(), &config.sampler);
        let mut results = stream::iter(grid.enumerate_chunks(chunk_size))
            .map(|chunk| self.process_chunk(&metas, &grid, chunk))
            .buffer_unordered(concurrency);
        while let Some(result) = results.next().await {
            totals.add(result?);
        }

        tracing::info!(
            "Processed {} chunks ({} skipped): {} composite px, {} index px, {} positive / {} negative candidates",
            totals.chunks_processed,
            totals.chunks_skipped,
            totals.composite_pixels,
            totals.index_pixels,
            totals.positive_candidates,
            totals.negative_candidates
        );

        check_defined(totals.index_pixels, grid.num_pixels())?;

        let samples: Vec<ClassSample> = totals.reservoirs.into_iter().map(ClassReservoir::finish).collect();
        let shortfalls: Vec<SampleShortfall> = samples.iter().filter_map(|s| s.shortfall.clone()).collect();
        for _ in &shortfalls {
            self.metrics.add_shortfall();
        }

        let table = TrainingTable::assemble(config.bands.clone(), grid.crs.clone(), samples);
        let positive_points = table.count(ClassLabel::Positive);
        let negative_points = table.count(ClassLabel::Negative);
        let nodata_rows = table.nodata_rows();
        self.metrics.set_points(positive_points as u64, negative_points as u64);
        self.metrics.set_nodata_points(nodata_rows as u64);

        let export_start = Instant::now();
        let export = export_table(&self.sink, &table, &config.destination).await?;
        self.metrics.add_bytes_exported(export.bytes as u64);
        self.metrics.add_stage_time(Stage::Export, export_start.elapsed());

        let scenes: Vec<SceneSummary> = metas
            .iter()
            .zip(totals.scene_valid_pixels)
            .map(|(meta, valid_pixels)| SceneSummary {
                scene_id: meta.scene_id.clone(),
                acquired: meta.acquired,
                cloud_pct: meta.cloud_pct,
                valid_pixels,
            })
            .collect();

        let report = PipelineReport {
            grid: PixelGrid::clone(&grid),
            chunk_size,
            chunks_processed: totals.chunks_processed,
            chunks_skipped: totals.chunks_skipped,
            scenes,
            composite_pixels: totals.composite_pixels,
            index_pixels: totals.index_pixels,
            positive_candidates: totals.positive_candidates,
            negative_candidates: totals.negative_candidates,
            positive_points,
            negative_points,
            nodata_rows,
            shortfalls,
            export,
            metrics: self.metrics.snapshot(),
            table,
        };

        tracing::info!("Pipeline complete: {}", report);

        Ok(report)
    }
}
