//! Parquet scene catalog with an R-tree footprint index.

use super::{CollectionFilter, Scene, SceneArchive, SceneMeta, SceneStore};
use crate::grid::{GridChunk, PixelGrid};
use anyhow::{Context, Result};
use arrow::array::{Array, Date32Array, Float32Array, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Date32Type, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::NaiveDate;
use object_store::{ObjectStore, ObjectStoreExt};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use rstar::{RTree, RTreeObject, AABB};
use std::sync::Arc;

/// Catalog row position kept alongside the scene so R-tree hits can be
/// returned in catalog order.
#[derive(Debug, Clone)]
struct IndexedScene {
    position: usize,
    scene: SceneMeta,
}

impl RTreeObject for IndexedScene {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.scene.envelope()
    }
}

/// All scenes of an archive with spatial query support.
pub struct SceneCatalog {
    /// Scenes in catalog order
    scenes: Vec<SceneMeta>,

    /// R-tree over scene footprints
    rtree: RTree<IndexedScene>,
}

impl SceneCatalog {
    pub fn new(scenes: Vec<SceneMeta>) -> Self {
        let indexed = scenes
            .iter()
            .cloned()
            .enumerate()
            .map(|(position, scene)| IndexedScene { position, scene })
            .collect();
        Self {
            scenes,
            rtree: RTree::bulk_load(indexed),
        }
    }

    /// Load catalog from a local parquet file.
    pub fn from_local_parquet(path: &str) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to open parquet file: {}", path))?;
        Self::from_parquet_bytes(Bytes::from(bytes))
    }

    /// Load catalog from an object store.
    pub async fn from_store(store: Arc<dyn ObjectStore>, path: &object_store::path::Path) -> Result<Self> {
        let bytes = store
            .get(path)
            .await
            .with_context(|| format!("Failed to fetch catalog {}", path))?
            .bytes()
            .await?;

        Self::from_parquet_bytes(bytes)
    }

    /// Load catalog from parquet bytes.
    pub fn from_parquet_bytes(bytes: Bytes) -> Result<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let reader = builder.build()?;

        let mut scenes = Vec::new();
        for batch_result in reader {
            let batch = batch_result?;
            Self::extract_scenes_from_batch(&batch, &mut scenes)?;
        }

        tracing::info!("Loaded {} scenes from parquet catalog", scenes.len());

        Ok(Self::new(scenes))
    }

    /// Extract scenes from a record batch.
    fn extract_scenes_from_batch(batch: &RecordBatch, scenes: &mut Vec<SceneMeta>) -> Result<()> {
        let schema = batch.schema();

        let id_col = Self::find_column(&schema, &["scene_id", "system:index", "id", "product_id"])?;
        let location_col = Self::find_column(&schema, &["location", "path", "uri", "url"])?;
        let date_col = Self::find_column(&schema, &["acquired", "date", "datetime", "sensing_date"])?;
        let cloud_col = Self::find_column(
            &schema,
            &["cloud_pct", "CLOUDY_PIXEL_PERCENTAGE", "cloud_cover", "eo:cloud_cover"],
        )?;

        let min_lon_col = Self::find_column(&schema, &["min_lon", "lon_min", "west"])?;
        let min_lat_col = Self::find_column(&schema, &["min_lat", "lat_min", "south"])?;
        let max_lon_col = Self::find_column(&schema, &["max_lon", "lon_max", "east"])?;
        let max_lat_col = Self::find_column(&schema, &["max_lat", "lat_max", "north"])?;

        // Rows from earlier batches are already in `scenes`
        let first_row = scenes.len();
        for col in [
            id_col,
            location_col,
            date_col,
            cloud_col,
            min_lon_col,
            min_lat_col,
            max_lon_col,
            max_lat_col,
        ] {
            Self::require_values(batch.column(col).as_ref(), schema.field(col).name(), first_row)?;
        }

        let ids = batch
            .column(id_col)
            .as_any()
            .downcast_ref::<StringArray>()
            .context("scene_id column must be string")?;
        let locations = batch
            .column(location_col)
            .as_any()
            .downcast_ref::<StringArray>()
            .context("location column must be string")?;
        let dates = Self::get_dates(batch.column(date_col))?;
        let cloud = Self::get_f64_array(batch.column(cloud_col))?;

        let min_lon = Self::get_f64_array(batch.column(min_lon_col))?;
        let min_lat = Self::get_f64_array(batch.column(min_lat_col))?;
        let max_lon = Self::get_f64_array(batch.column(max_lon_col))?;
        let max_lat = Self::get_f64_array(batch.column(max_lat_col))?;

        for i in 0..batch.num_rows() {
            scenes.push(SceneMeta {
                scene_id: ids.value(i).to_string(),
                location: locations.value(i).to_string(),
                acquired: dates[i],
                cloud_pct: cloud[i],
                footprint_wgs84: [min_lon[i], min_lat[i], max_lon[i], max_lat[i]],
            });
        }

        Ok(())
    }

    /// Find a column by checking multiple possible names.
    fn find_column(schema: &SchemaRef, names: &[&str]) -> Result<usize> {
        for name in names {
            if let Some((idx, _)) = schema.column_with_name(name) {
                return Ok(idx);
            }
        }
        anyhow::bail!("Could not find column with any of these names: {:?}", names)
    }

    /// Fail on the first null in a column every scene needs.
    fn require_values(array: &dyn Array, name: &str, first_row: usize) -> Result<()> {
        if array.null_count() == 0 {
            return Ok(());
        }
        match (0..array.len()).find(|&i| array.is_null(i)) {
            Some(i) => anyhow::bail!("Catalog row {} has a null {}", first_row + i, name),
            None => Ok(()),
        }
    }

    /// Get f64 values from an array (handles f32, f64 and integers).
    fn get_f64_array(array: &Arc<dyn Array>) -> Result<Vec<f64>> {
        if let Some(arr) = array.as_any().downcast_ref::<Float64Array>() {
            Ok((0..arr.len()).map(|i| arr.value(i)).collect())
        } else if let Some(arr) = array.as_any().downcast_ref::<Float32Array>() {
            Ok((0..arr.len()).map(|i| arr.value(i) as f64).collect())
        } else if let Some(arr) = array.as_any().downcast_ref::<Int64Array>() {
            Ok((0..arr.len()).map(|i| arr.value(i) as f64).collect())
        } else if let Some(arr) = array.as_any().downcast_ref::<Int32Array>() {
            Ok((0..arr.len()).map(|i| arr.value(i) as f64).collect())
        } else {
            anyhow::bail!("Expected numeric array, got {:?}", array.data_type())
        }
    }

    /// Get dates from a Date32 column or an ISO-8601 string column.
    fn get_dates(array: &Arc<dyn Array>) -> Result<Vec<NaiveDate>> {
        if let Some(arr) = array.as_any().downcast_ref::<Date32Array>() {
            (0..arr.len())
                .map(|i| arr.value_as_date(i).with_context(|| format!("Invalid date at row {}", i)))
                .collect()
        } else if let Some(arr) = array.as_any().downcast_ref::<StringArray>() {
            (0..arr.len())
                .map(|i| {
                    let value = arr.value(i);
                    // Accept full timestamps by keeping the date part
                    let date = value.get(..10).unwrap_or(value);
                    NaiveDate::parse_from_str(date, "%Y-%m-%d")
                        .with_context(|| format!("Invalid date '{}' at row {}", value, i))
                })
                .collect()
        } else {
            anyhow::bail!("Expected date or string array, got {:?}", array.data_type())
        }
    }

    /// Serialize the catalog as parquet.
    pub fn to_parquet_bytes(&self) -> Result<Bytes> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("scene_id", DataType::Utf8, false),
            Field::new("location", DataType::Utf8, false),
            Field::new("acquired", DataType::Date32, false),
            Field::new("cloud_pct", DataType::Float64, false),
            Field::new("min_lon", DataType::Float64, false),
            Field::new("min_lat", DataType::Float64, false),
            Field::new("max_lon", DataType::Float64, false),
            Field::new("max_lat", DataType::Float64, false),
        ]));

        let footprint = |i: usize| -> Arc<dyn Array> {
            Arc::new(Float64Array::from_iter_values(self.scenes.iter().map(|s| s.footprint_wgs84[i])))
        };

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from_iter_values(self.scenes.iter().map(|s| s.scene_id.as_str()))),
                Arc::new(StringArray::from_iter_values(self.scenes.iter().map(|s| s.location.as_str()))),
                Arc::new(Date32Array::from_iter_values(
                    self.scenes.iter().map(|s| Date32Type::from_naive_date(s.acquired)),
                )),
                Arc::new(Float64Array::from_iter_values(self.scenes.iter().map(|s| s.cloud_pct))),
                footprint(0),
                footprint(1),
                footprint(2),
                footprint(3),
            ],
        )?;

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;

        Ok(Bytes::from(buffer))
    }

    /// Scenes matching the filter, in catalog order.
    pub fn filter(&self, filter: &CollectionFilter) -> Vec<SceneMeta> {
        let bounds = filter.region.bounds();
        let envelope = AABB::from_corners([bounds[0], bounds[1]], [bounds[2], bounds[3]]);

        let mut hits: Vec<&IndexedScene> = self
            .rtree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|entry| filter.matches(&entry.scene))
            .collect();
        hits.sort_by_key(|entry| entry.position);

        let filtered: Vec<SceneMeta> = hits.into_iter().map(|entry| entry.scene.clone()).collect();

        tracing::info!(
            "Filtered {} -> {} scenes (region: {}, dates: {}..={}, cloud < {}%)",
            self.scenes.len(),
            filtered.len(),
            filter.region,
            filter.start,
            filter.end,
            filter.max_cloud_pct
        );

        filtered
    }

    /// Get all scenes.
    pub fn all_scenes(&self) -> &[SceneMeta] {
        &self.scenes
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

/// Archive backed by a parquet catalog and per-scene Zarr arrays.
pub struct CatalogArchive {
    catalog: SceneCatalog,
    scenes: SceneStore,
}

impl CatalogArchive {
    pub fn new(catalog: SceneCatalog, scenes: SceneStore) -> Self {
        Self { catalog, scenes }
    }
}

impl SceneArchive for CatalogArchive {
    async fn query(&self, filter: &CollectionFilter) -> Result<Vec<SceneMeta>> {
        Ok(self.catalog.filter(filter))
    }

    async fn load(&self, scene: &SceneMeta, grid: &PixelGrid, window: &GridChunk) -> Result<Scene> {
        self.scenes.read_window(scene, grid, window).await
    }
}
