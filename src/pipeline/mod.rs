//! Pipeline orchestration and run metrics.

mod metrics;
mod stages;

pub use metrics::{Metrics, MetricsSnapshot, Stage};
pub use stages::{ChunkOutcome, ChunkResult, Pipeline, PipelineConfig, PipelineReport, SceneSummary};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::synthetic::{CloudPatch, SyntheticCollection, BANDS};
    use crate::archive::{CollectionFilter, MemoryArchive};
    use crate::crs::codes::WGS84;
    use crate::error::PipelineError;
    use crate::grid::PixelGrid;
    use crate::io::{ExportDestination, ExportSink, MemorySink, TableFormat};
    use crate::region::Region;
    use crate::sampling::StratifiedSampler;
    use crate::transform::{ClassLabel, CloudMask, Thresholds};
    use bytes::Bytes;
    use chrono::NaiveDate;

    const REGION: [f64; 4] = [-3.0, 6.5, -1.5, 8.5];
    const RESOLUTION: f64 = 0.01;
    const EXPORT_PATH: &str = "GEE_Exports/BrongAhafo_TrainData_2023.csv";

    /// 200x150 grid in 4x3 chunks
    const CHUNK_SIZE: usize = 64;

    /// Six full scenes over all 12 chunks, the partial scene over the
    /// western two chunk columns
    const WINDOW_LOADS: usize = 6 * 12 + 4 * 2;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn config(points_per_class: usize) -> PipelineConfig {
        PipelineConfig {
            filter: CollectionFilter {
                region: Region::new(REGION).unwrap(),
                start: date(2023, 4, 1),
                end: date(2023, 7, 31),
                max_cloud_pct: 20.0,
            },
            grid_crs: WGS84.to_string(),
            resolution: RESOLUTION,
            cloud_mask: CloudMask::default(),
            bands: BANDS.iter().map(|b| b.to_string()).collect(),
            nir_band: "B8".to_string(),
            red_band: "B4".to_string(),
            thresholds: Thresholds::default(),
            sampler: StratifiedSampler {
                points_per_class,
                positive_seed: 2,
                negative_seed: 1,
                scale: RESOLUTION,
            },
            destination: ExportDestination {
                description: "BrongAhafo_TrainingData_Export".to_string(),
                folder: "GEE_Exports".to_string(),
                file_name_prefix: "BrongAhafo_TrainData_2023".to_string(),
                format: TableFormat::Csv,
            },
            chunk_size: CHUNK_SIZE,
            chunk_concurrency: 3,
            load_concurrency: 4,
        }
    }

    fn synthetic() -> SyntheticCollection {
        let grid = PixelGrid::from_bounds(REGION, WGS84.to_string(), RESOLUTION);
        SyntheticCollection::new(grid, REGION, 42)
    }

    fn season_archive() -> MemoryArchive {
        MemoryArchive::new(synthetic().season(date(2023, 4, 1), date(2023, 7, 31)))
    }

    struct FailingSink;

    impl ExportSink for FailingSink {
        async fn write(&self, _destination: &ExportDestination, _payload: Bytes) -> anyhow::Result<()> {
            anyhow::bail!("bucket is read-only")
        }
    }

    #[tokio::test]
    async fn test_brong_ahafo_season() {
        let pipeline = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), config(300));
        let report = pipeline.run().await.unwrap();

        assert_eq!(report.grid.shape(), (200, 150));
        assert_eq!(report.scenes.len(), 7);
        assert_eq!(report.chunks_processed, 12);
        assert_eq!(report.chunks_skipped, 0);
        assert_eq!(pipeline.archive().load_count(), WINDOW_LOADS);
        assert!(pipeline.archive().largest_window() <= CHUNK_SIZE * CHUNK_SIZE);
        assert!(report.scenes.iter().all(|s| s.cloud_pct < 20.0));
        assert!(report.scenes.iter().all(|s| s.valid_pixels > 0));

        assert_eq!(report.positive_points, 300);
        assert_eq!(report.negative_points, 300);
        assert!(report.shortfalls.is_empty());
        assert_eq!(report.table.len(), 600);
        assert_eq!(report.nodata_rows, report.table.nodata_rows());

        // Positive rows first, ids unique per class
        assert!(report.table.rows[..300].iter().all(|r| r.class == ClassLabel::Positive));
        assert!(report.table.rows[300..].iter().all(|r| r.class == ClassLabel::Negative));
        assert_eq!(report.table.rows[0].id, "1_0");
        assert_eq!(report.table.rows[300].id, "0_0");

        let csv = pipeline.sink().get(EXPORT_PATH).unwrap();
        let text = std::str::from_utf8(&csv).unwrap();
        assert_eq!(text.lines().count(), 601);
        assert!(text.starts_with("system:index,B2,B3,B4,B8,B11,B12,class,.geo\n"));
        assert_eq!(report.export.bytes, csv.len());

        let metrics = &report.metrics;
        assert_eq!(metrics.scenes_matched, 7);
        assert_eq!(metrics.windows_loaded, WINDOW_LOADS as u64);
        assert_eq!(metrics.chunks_processed, 12);
        assert_eq!(metrics.composite_pixels, report.composite_pixels as u64);
        assert_eq!(metrics.positive_points, 300);
        assert_eq!(metrics.bytes_exported, csv.len() as u64);
    }

    #[tokio::test]
    async fn test_sampled_points_match_thresholds() {
        let pipeline = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), config(200));
        let report = pipeline.run().await.unwrap();

        let b4 = report.table.band_names.iter().position(|b| b == "B4").unwrap();
        let b8 = report.table.band_names.iter().position(|b| b == "B8").unwrap();
        for row in &report.table.rows {
            let (red, nir) = (row.values[b4].unwrap(), row.values[b8].unwrap());
            let ndvi = (nir - red) / (nir + red);
            match row.class {
                ClassLabel::Positive => assert!(ndvi > 0.4, "{} has NDVI {}", row.id, ndvi),
                ClassLabel::Negative => assert!(ndvi < 0.2, "{} has NDVI {}", row.id, ndvi),
            }
        }
    }

    #[tokio::test]
    async fn test_runs_are_reproducible() {
        let first = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), config(100));
        let second = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), config(100));

        let a = first.run().await.unwrap();
        let b = second.run().await.unwrap();

        assert_eq!(a.table, b.table);
        assert_eq!(first.sink().get(EXPORT_PATH), second.sink().get(EXPORT_PATH));
    }

    #[tokio::test]
    async fn test_chunk_size_keeps_pixel_counts() {
        let mut whole = config(300);
        whole.chunk_size = 1000;

        let chunked = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), config(300));
        let single = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), whole);
        let a = chunked.run().await.unwrap();
        let b = single.run().await.unwrap();

        assert_eq!(b.chunks_processed, 1);
        assert_eq!(single.archive().load_count(), 7);
        assert_eq!(a.composite_pixels, b.composite_pixels);
        assert_eq!(a.index_pixels, b.index_pixels);
        assert_eq!(a.positive_candidates, b.positive_candidates);
        assert_eq!(a.negative_candidates, b.negative_candidates);

        let valid = |report: &PipelineReport| report.scenes.iter().map(|s| s.valid_pixels).collect::<Vec<_>>();
        assert_eq!(valid(&a), valid(&b));
        assert_eq!(a.table.len(), b.table.len());
    }

    #[tokio::test]
    async fn test_fully_clouded_collection_is_degenerate() {
        let synthetic = synthetic();
        let overcast = CloudPatch {
            row: 0,
            col: 0,
            height: 200,
            width: 150,
            cirrus: true,
        };
        let archive = MemoryArchive::new(vec![synthetic.scene("S2_GREY", date(2023, 5, 10), &[overcast])]);
        let mut settings = config(300);
        settings.filter.max_cloud_pct = 101.0;

        let pipeline = Pipeline::new(archive, MemorySink::new(), Metrics::new(), settings);
        let err = pipeline.run().await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DegenerateIndex { pixels: 30_000 })
        ));
        assert!(pipeline.sink().is_empty());
    }

    #[tokio::test]
    async fn test_empty_collection_stops_before_loading() {
        let mut settings = config(300);
        settings.filter.start = date(2020, 1, 1);
        settings.filter.end = date(2020, 12, 31);

        let pipeline = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), settings);
        let err = pipeline.run().await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EmptyCollection { .. })
        ));
        assert_eq!(pipeline.archive().load_count(), 0);
        assert!(pipeline.sink().is_empty());
    }

    #[tokio::test]
    async fn test_shortfall_returns_every_candidate() {
        let pipeline = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), config(5000));
        let report = pipeline.run().await.unwrap();

        assert!(report.negative_candidates < 5000);
        assert!(report.positive_candidates >= 5000);
        assert_eq!(report.positive_points, 5000);
        assert_eq!(report.negative_points, report.negative_candidates);

        assert_eq!(report.shortfalls.len(), 1);
        let shortfall = &report.shortfalls[0];
        assert_eq!(shortfall.class, ClassLabel::Negative);
        assert_eq!(shortfall.requested, 5000);
        assert_eq!(shortfall.available, report.negative_candidates);
        assert_eq!(report.metrics.shortfalls, 1);
        assert_eq!(report.table.len(), 5000 + report.negative_candidates);
    }

    #[tokio::test]
    async fn test_cloudy_pixels_never_sampled() {
        let synthetic = synthetic();
        let patch = CloudPatch {
            row: 0,
            col: 0,
            height: 40,
            width: 30,
            cirrus: false,
        };
        let archive = MemoryArchive::new(vec![synthetic.scene("S2_ONLY", date(2023, 5, 10), &[patch])]);

        let pipeline = Pipeline::new(archive, MemorySink::new(), Metrics::new(), config(300));
        let report = pipeline.run().await.unwrap();

        assert_eq!(report.composite_pixels, 200 * 150 - 40 * 30);
        let grid = &report.grid;
        for row in &report.table.rows {
            let (r, c) = grid.crs_to_pixel(row.x, row.y).unwrap();
            assert!(!patch_contains(&patch, r, c), "{} sampled under cloud", row.id);
        }
    }

    fn patch_contains(patch: &CloudPatch, row: usize, col: usize) -> bool {
        row < patch.row + patch.height && col < patch.col + patch.width
    }

    #[tokio::test]
    async fn test_export_failure_is_reported() {
        let pipeline = Pipeline::new(season_archive(), FailingSink, Metrics::new(), config(50));
        let err = pipeline.run().await.unwrap_err();

        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Export { destination, .. }) => assert_eq!(destination, EXPORT_PATH),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_lists_matching_scenes() {
        let pipeline = Pipeline::new(season_archive(), MemorySink::new(), Metrics::new(), config(300));
        let scenes = pipeline.query().await.unwrap();

        assert_eq!(scenes.len(), 7);
        // Archive order, partial-footprint scene last
        assert!(scenes[..6].windows(2).all(|w| w[0].acquired < w[1].acquired));
        assert!(scenes[6].scene_id.ends_with("_06"));
        assert_eq!(pipeline.archive().load_count(), 0);
    }
}
