//! Run counters and per-stage timings.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Pipeline stage, for timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Query,
    Load,
    Mask,
    Composite,
    Index,
    Sample,
    Extract,
    Export,
}

/// Metrics for one pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Scenes returned by the collection filter
    pub scenes_matched: AtomicU64,

    /// Scene windows fetched from the archive
    pub windows_loaded: AtomicU64,

    /// Raw band and QA bytes of loaded windows
    pub bytes_read: AtomicU64,

    /// Chunks masked, composited and sampled
    pub chunks_processed: AtomicU64,

    /// Chunks outside the region or without overlapping scenes
    pub chunks_skipped: AtomicU64,

    /// Valid (unmasked) scene pixels summed over all scenes
    pub valid_observations: AtomicU64,

    /// Composite pixels with at least one valid observation
    pub composite_pixels: AtomicU64,

    pub positive_points: AtomicU64,

    pub negative_points: AtomicU64,

    /// Points on no-data composite pixels
    pub nodata_points: AtomicU64,

    /// Classes with fewer candidates than requested
    pub shortfalls: AtomicU64,

    /// Bytes written to the export sink
    pub bytes_exported: AtomicU64,

    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    pub query_us: AtomicU64,
    pub load_us: AtomicU64,
    pub mask_us: AtomicU64,
    pub composite_us: AtomicU64,
    pub index_us: AtomicU64,
    pub sample_us: AtomicU64,
    pub extract_us: AtomicU64,
    pub export_us: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn set_scenes_matched(&self, count: u64) {
        self.scenes_matched.store(count, Ordering::Relaxed);
    }

    /// Record a loaded scene window and its raw size.
    pub fn add_window_loaded(&self, bytes: u64) {
        self.windows_loaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_chunk_processed(&self) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_skipped(&self) {
        self.chunks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_valid_observations(&self, count: u64) {
        self.valid_observations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_composite_pixels(&self, count: u64) {
        self.composite_pixels.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_points(&self, positive: u64, negative: u64) {
        self.positive_points.store(positive, Ordering::Relaxed);
        self.negative_points.store(negative, Ordering::Relaxed);
    }

    pub fn set_nodata_points(&self, count: u64) {
        self.nodata_points.store(count, Ordering::Relaxed);
    }

    pub fn add_shortfall(&self) {
        self.shortfalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_exported(&self, bytes: u64) {
        self.bytes_exported.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record time spent in a stage.
    pub fn add_stage_time(&self, stage: Stage, duration: Duration) {
        let counter = match stage {
            Stage::Query => &self.query_us,
            Stage::Load => &self.load_us,
            Stage::Mask => &self.mask_us,
            Stage::Composite => &self.composite_us,
            Stage::Index => &self.index_us,
            Stage::Sample => &self.sample_us,
            Stage::Extract => &self.extract_us,
            Stage::Export => &self.export_us,
        };
        counter.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get read throughput in MB/s.
    pub fn read_throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_read.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes as f64) / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |counter: &AtomicU64| counter.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            scenes_matched: self.scenes_matched.load(Ordering::Relaxed),
            windows_loaded: self.windows_loaded.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            chunks_skipped: self.chunks_skipped.load(Ordering::Relaxed),
            valid_observations: self.valid_observations.load(Ordering::Relaxed),
            composite_pixels: self.composite_pixels.load(Ordering::Relaxed),
            positive_points: self.positive_points.load(Ordering::Relaxed),
            negative_points: self.negative_points.load(Ordering::Relaxed),
            nodata_points: self.nodata_points.load(Ordering::Relaxed),
            shortfalls: self.shortfalls.load(Ordering::Relaxed),
            bytes_exported: self.bytes_exported.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            read_throughput_mbps: self.read_throughput_mbps(),
            query_secs: secs(&self.query_us),
            load_secs: secs(&self.load_us),
            mask_secs: secs(&self.mask_us),
            composite_secs: secs(&self.composite_us),
            index_secs: secs(&self.index_us),
            sample_secs: secs(&self.sample_us),
            extract_secs: secs(&self.extract_us),
            export_secs: secs(&self.export_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub scenes_matched: u64,
    pub windows_loaded: u64,
    pub bytes_read: u64,
    pub chunks_processed: u64,
    pub chunks_skipped: u64,
    pub valid_observations: u64,
    pub composite_pixels: u64,
    pub positive_points: u64,
    pub negative_points: u64,
    pub nodata_points: u64,
    pub shortfalls: u64,
    pub bytes_exported: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub read_throughput_mbps: f64,
    pub query_secs: f64,
    pub load_secs: f64,
    pub mask_secs: f64,
    pub composite_secs: f64,
    pub index_secs: f64,
    pub sample_secs: f64,
    pub extract_secs: f64,
    pub export_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Stage timings in pipeline order.
    fn stage_times(&self) -> [(&'static str, f64); 8] {
        [
            ("Query", self.query_secs),
            ("Load", self.load_secs),
            ("Mask", self.mask_secs),
            ("Composite", self.composite_secs),
            ("Index", self.index_secs),
            ("Sample", self.sample_secs),
            ("Extract", self.extract_secs),
            ("Export", self.export_secs),
        ]
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", self.elapsed.as_secs_f64());
        println!("Scenes: {} matched, {} windows loaded", self.scenes_matched, self.windows_loaded);
        println!("Chunks: {} processed, {} skipped", self.chunks_processed, self.chunks_skipped);
        println!(
            "Data read: {:.2} MB ({:.1} MB/s)",
            self.bytes_read as f64 / (1024.0 * 1024.0),
            self.read_throughput_mbps
        );
        println!("Valid observations: {}", self.valid_observations);
        println!("Composite pixels with data: {}", self.composite_pixels);
        println!(
            "Points: {} positive, {} negative ({} on no-data)",
            self.positive_points, self.negative_points, self.nodata_points
        );
        if self.shortfalls > 0 {
            println!("Classes short of requested points: {}", self.shortfalls);
        }
        println!("Exported: {} bytes", self.bytes_exported);

        let total: f64 = self.stage_times().iter().map(|(_, s)| s).sum();
        if total > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            for (name, secs) in self.stage_times() {
                println!("{:<10} {:>7.2}s ({:>5.1}%)", format!("{}:", name), secs, secs / total * 100.0);
            }
        }
        println!("========================\n");
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Scenes: {} matched, {} windows | Chunks: {} processed, {} skipped | Read: {:.2} MB | Composite: {} px | \
             Points: {} positive, {} negative, {} no-data | Shortfalls: {} | \
             Exported: {} bytes | Elapsed: {:.1}s",
            self.scenes_matched,
            self.windows_loaded,
            self.chunks_processed,
            self.chunks_skipped,
            self.bytes_read as f64 / (1024.0 * 1024.0),
            self.composite_pixels,
            self.positive_points,
            self.negative_points,
            self.nodata_points,
            self.shortfalls,
            self.bytes_exported,
            self.elapsed.as_secs_f64(),
        )
    }
}
