//! Sample points and the labeled training table.

use super::ClassSample;
use crate::transform::ClassLabel;
use serde::Serialize;

/// A sampled pixel centre.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePoint {
    pub class: ClassLabel,

    pub row: usize,

    pub col: usize,

    /// Pixel centre in grid CRS
    pub x: f64,

    pub y: f64,
}

/// One exported row: a sample point with its band values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingRow {
    /// Row identifier, unique within a table (`<class>_<n>`)
    pub id: String,

    pub class: ClassLabel,

    pub x: f64,

    pub y: f64,

    /// Band values in table band order, `None` for no-data
    pub values: Vec<Option<f32>>,
}

impl TrainingRow {
    /// Whether any band value is no-data.
    pub fn is_nodata(&self) -> bool {
        self.values.iter().any(Option::is_none)
    }
}

/// Labeled training table: positive rows first, then negative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingTable {
    pub band_names: Vec<String>,

    /// CRS of row coordinates
    pub crs: String,

    pub rows: Vec<TrainingRow>,
}

impl TrainingTable {
    /// Concatenate class samples in the order given.
    pub fn assemble(band_names: Vec<String>, crs: String, samples: Vec<ClassSample>) -> Self {
        let rows: Vec<TrainingRow> = samples.into_iter().flat_map(|sample| sample.rows).collect();
        let table = Self { band_names, crs, rows };

        let nodata = table.nodata_rows();
        if nodata > 0 {
            tracing::warn!("{} of {} sample points fall on no-data composite pixels", nodata, table.len());
        }

        table
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn count(&self, class: ClassLabel) -> usize {
        self.rows.iter().filter(|r| r.class == class).count()
    }

    /// Number of rows carrying at least one no-data value.
    pub fn nodata_rows(&self) -> usize {
        self.rows.iter().filter(|r| r.is_nodata()).count()
    }
}
