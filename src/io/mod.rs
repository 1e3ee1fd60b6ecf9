//! I/O: object stores and table export.

mod export;
mod store;

pub use export::{
    encode_table, export_table, ExportDestination, ExportSink, ExportSummary, MemorySink, ObjectStoreSink,
    TableFormat,
};
pub use store::{create_local_store, create_s3_store, Location, S3Access};
