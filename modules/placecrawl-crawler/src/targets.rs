// Target list (administrative areas) and the missing-artifact audit.
//
// CSV columns: adm_dong_code, city, district, neighborhood.
// The search key is "<district> <neighborhood>".

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use placecrawl_common::Target;
use placecrawl_store::{RecordKind, RecordSink};

#[derive(Debug, Deserialize)]
struct TargetRow {
    adm_dong_code: String,
    city: String,
    district: String,
    neighborhood: String,
}

impl From<TargetRow> for Target {
    fn from(row: TargetRow) -> Self {
        let mut target = Target::new(
            row.adm_dong_code.trim(),
            format!("{} {}", row.district.trim(), row.neighborhood.trim()),
        );
        target.city = Some(row.city.trim().to_string()).filter(|c| !c.is_empty());
        target.district = Some(row.district.trim().to_string()).filter(|d| !d.is_empty());
        target
    }
}

/// Load targets, keeping only `districts` when it is non-empty.
pub fn load_targets(path: &Path, districts: &[String]) -> Result<Vec<Target>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open target list {}", path.display()))?;

    let mut targets = Vec::new();
    for row in reader.deserialize::<TargetRow>() {
        let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        if !districts.is_empty() && !districts.iter().any(|d| d == row.district.trim()) {
            continue;
        }
        targets.push(Target::from(row));
    }
    Ok(targets)
}

/// A target with at least one output artifact absent or empty.
#[derive(Debug, Clone)]
pub struct MissingArtifacts {
    pub target: Target,
    pub kinds: Vec<RecordKind>,
}

pub async fn missing_artifacts(
    targets: &[Target],
    sink: &dyn RecordSink,
) -> placecrawl_store::Result<Vec<MissingArtifacts>> {
    let mut missing = Vec::new();
    for target in targets {
        let mut kinds = Vec::new();
        for kind in RecordKind::OUTPUT {
            if !sink.has_artifact(&target.id, kind).await? {
                kinds.push(kind);
            }
        }
        if !kinds.is_empty() {
            missing.push(MissingArtifacts {
                target: target.clone(),
                kinds,
            });
        }
    }
    Ok(missing)
}
