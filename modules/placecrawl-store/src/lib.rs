pub mod csv_store;
pub mod error;
pub mod export;
mod rows;
pub mod sink;

pub use csv_store::CsvStore;
pub use error::{Result, StoreError};
pub use export::{export_json, ExportSummary};
pub use sink::{FailureLog, RecordKind, RecordSink, WriteSummary};
