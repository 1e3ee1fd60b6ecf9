//! Training table serialization and export sinks.

use crate::error::PipelineError;
use crate::sampling::TrainingTable;
use anyhow::Result;
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Serialized table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    Csv,
    #[value(name = "geojson")]
    GeoJson,
}

impl TableFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::GeoJson => "geojson",
        }
    }
}

/// Where an exported table lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDestination {
    /// Task description, used in logs
    pub description: String,

    /// Folder inside the sink
    pub folder: String,

    /// File name without extension
    pub file_name_prefix: String,

    pub format: TableFormat,
}

impl ExportDestination {
    /// Object path relative to the sink root.
    pub fn object_path(&self) -> String {
        let folder = self.folder.trim_matches('/');
        let file = format!("{}.{}", self.file_name_prefix, self.format.extension());
        if folder.is_empty() {
            file
        } else {
            format!("{}/{}", folder, file)
        }
    }
}

impl std::fmt::Display for ExportDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.object_path())
    }
}

/// Storage service receiving exported tables.
#[allow(async_fn_in_trait)]
pub trait ExportSink {
    /// Store the complete payload at the destination in one write.
    async fn write(&self, destination: &ExportDestination, payload: Bytes) -> Result<()>;
}

/// Sink backed by an object store (local filesystem or S3).
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,

    /// Path prefix inside the store
    prefix: String,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn path(&self, destination: &ExportDestination) -> Path {
        if self.prefix.is_empty() {
            Path::from(destination.object_path())
        } else {
            Path::from(format!("{}/{}", self.prefix, destination.object_path()))
        }
    }
}

impl ExportSink for ObjectStoreSink {
    async fn write(&self, destination: &ExportDestination, payload: Bytes) -> Result<()> {
        let path = self.path(destination);
        self.store.put(&path, PutPayload::from(payload)).await?;
        Ok(())
    }
}

/// In-process sink.
#[derive(Default)]
pub struct MemorySink {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExportSink for MemorySink {
    async fn write(&self, destination: &ExportDestination, payload: Bytes) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(destination.object_path(), payload);
        Ok(())
    }
}

/// Outcome of a completed export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSummary {
    pub path: String,
    pub rows: usize,
    pub bytes: usize,
}

/// Serialize a table in the requested format.
pub fn encode_table(table: &TrainingTable, format: TableFormat) -> Result<Bytes> {
    match format {
        TableFormat::Csv => Ok(encode_csv(table)),
        TableFormat::GeoJson => encode_geojson(table),
    }
}

/// Point geometry as a GeoJSON string.
fn point_geometry(x: f64, y: f64) -> String {
    format!(r#"{{"type":"Point","coordinates":[{},{}]}}"#, x, y)
}

/// Quote a CSV field when it contains a delimiter, quote or newline.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn encode_csv(table: &TrainingTable) -> Bytes {
    let mut header = vec!["system:index".to_string()];
    header.extend(table.band_names.iter().cloned());
    header.push("class".to_string());
    header.push(".geo".to_string());

    let mut out = header.iter().map(|h| csv_field(h)).collect::<Vec<_>>().join(",");
    out.push('\n');

    for row in &table.rows {
        let mut fields = vec![csv_field(&row.id)];
        fields.extend(
            row.values
                .iter()
                .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
        );
        fields.push(row.class.to_string());
        fields.push(csv_field(&point_geometry(row.x, row.y)));
        out.push_str(&fields.join(","));
        out.push('\n');
    }

    Bytes::from(out)
}

fn encode_geojson(table: &TrainingTable) -> Result<Bytes> {
    let features: Vec<serde_json::Value> = table
        .rows
        .iter()
        .map(|row| {
            let mut properties = serde_json::Map::new();
            for (band, value) in table.band_names.iter().zip(row.values.iter()) {
                properties.insert(band.clone(), serde_json::json!(value));
            }
            properties.insert("class".to_string(), serde_json::json!(row.class));
            serde_json::json!({
                "type": "Feature",
                "id": row.id,
                "geometry": { "type": "Point", "coordinates": [row.x, row.y] },
                "properties": properties,
            })
        })
        .collect();

    let collection = serde_json::json!({
        "type": "FeatureCollection",
        "crs": { "type": "name", "properties": { "name": table.crs } },
        "features": features,
    });

    Ok(Bytes::from(serde_json::to_vec(&collection)?))
}

/// Serialize the table and write it to the sink with a single put.
pub async fn export_table<S: ExportSink>(
    sink: &S,
    table: &TrainingTable,
    destination: &ExportDestination,
) -> crate::error::Result<ExportSummary> {
    let to_export_error = |source: anyhow::Error| PipelineError::Export {
        destination: destination.object_path(),
        source,
    };

    let payload = encode_table(table, destination.format).map_err(to_export_error)?;
    let bytes = payload.len();

    tracing::info!(
        "Export '{}': {} rows ({} bytes) -> {}",
        destination.description,
        table.len(),
        bytes,
        destination
    );

    sink.write(destination, payload).await.map_err(to_export_error)?;

    Ok(ExportSummary {
        path: destination.object_path(),
        rows: table.len(),
        bytes,
    })
}
