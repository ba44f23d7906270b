// CSV artifacts → JSON arrays, one file per artifact.
// Empty cells and the literal strings "null" / "None" are dropped per row.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Result, StoreError};

const BLANK_VALUES: [&str; 3] = ["", "null", "None"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub files: usize,
    pub rows: usize,
}

/// Convert every `<data_dir>/<kind>/*.csv` into `<out_dir>/<stem>.json`.
pub fn export_json(data_dir: &Path, out_dir: &Path) -> Result<ExportSummary> {
    fs::create_dir_all(out_dir).map_err(|e| StoreError::io(out_dir, e))?;

    let mut summary = ExportSummary::default();
    for csv_path in artifact_files(data_dir)? {
        let Some(stem) = csv_path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let json_path = out_dir.join(format!("{stem}.json"));

        let records = read_records(&csv_path)?;
        let body = serde_json::to_string_pretty(&records)?;
        fs::write(&json_path, body).map_err(|e| StoreError::io(&json_path, e))?;

        info!(
            from = %csv_path.display(),
            to = %json_path.display(),
            rows = records.len(),
            "Converted"
        );
        summary.files += 1;
        summary.rows += records.len();
    }
    Ok(summary)
}

/// CSV files exactly one directory below `data_dir`, sorted.
fn artifact_files(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = fs::read_dir(data_dir).map_err(|e| StoreError::io(data_dir, e))?;
    for entry in entries {
        let dir = entry.map_err(|e| StoreError::io(data_dir, e))?.path();
        if !dir.is_dir() {
            continue;
        }
        for file in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let path = file.map_err(|e| StoreError::io(&dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "csv") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn read_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| StoreError::csv(path, e))?;
    let headers = reader
        .headers()
        .map_err(|e| StoreError::csv(path, e))?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| StoreError::csv(path, e))?;
        let record: Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, value)| !BLANK_VALUES.contains(value))
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect();
        records.push(record);
    }
    Ok(records)
}
