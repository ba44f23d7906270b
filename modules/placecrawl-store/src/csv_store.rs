//! CSV-file implementation of [`RecordSink`] and [`FailureLog`].
//!
//! Layout under the data root, one file per (kind, target):
//!
//! ```text
//! place_info/place_info_<target>.csv
//! reviews/reviews_<target>.csv
//! failed_places/failed_<target>.csv
//! ```
//!
//! Every operation touching a target runs under that target's async mutex, so
//! concurrent items of the same target never interleave appends. File I/O runs
//! on the blocking pool while the partition lock is held.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use placecrawl_common::{EntityId, FailureRecord, PlaceRecord, TargetId};

use crate::error::{Result, StoreError};
use crate::rows::{PlaceKey, PlaceRow, ReviewRow};
use crate::sink::{FailureLog, RecordKind, RecordSink, WriteSummary};

pub struct CsvStore {
    root: PathBuf,
    partitions: Mutex<HashMap<TargetId, Arc<AsyncMutex<Partition>>>>,
}

/// Writer-side state of one target. Only touched under its mutex.
#[derive(Default)]
struct Partition {
    index: Option<PartitionIndex>,
}

/// Entities already on disk, loaded once per process from the artifacts.
#[derive(Debug, Default)]
struct PartitionIndex {
    places: HashSet<EntityId>,
    reviewed: HashSet<EntityId>,
}

impl CsvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, target: &TargetId, kind: RecordKind) -> PathBuf {
        self.root
            .join(kind.dir())
            .join(format!("{}_{}.csv", kind.prefix(), file_stem(target)))
    }

    fn partition(&self, target: &TargetId) -> Arc<AsyncMutex<Partition>> {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        partitions.entry(target.clone()).or_default().clone()
    }

    async fn ensure_index<'p>(
        &self,
        target: &TargetId,
        partition: &'p mut Partition,
    ) -> Result<&'p mut PartitionIndex> {
        if partition.index.is_none() {
            let place_path = self.artifact_path(target, RecordKind::PlaceInfo);
            let review_path = self.artifact_path(target, RecordKind::Reviews);
            let index = tokio::task::spawn_blocking(move || -> Result<PartitionIndex> {
                Ok(PartitionIndex {
                    places: read_place_ids(&place_path)?,
                    reviewed: read_place_ids(&review_path)?,
                })
            })
            .await??;
            debug!(
                target_id = %target,
                places = index.places.len(),
                "Loaded partition index"
            );
            partition.index = Some(index);
        }
        Ok(partition.index.get_or_insert_with(PartitionIndex::default))
    }
}

#[async_trait]
impl RecordSink for CsvStore {
    async fn write(&self, target: &TargetId, records: &[PlaceRecord]) -> Result<WriteSummary> {
        let partition = self.partition(target);
        let mut guard = partition.lock().await;
        let index = self.ensure_index(target, &mut guard).await?;

        let mut summary = WriteSummary::default();
        let mut batch_ids = HashSet::new();
        let mut fresh: Vec<PlaceRecord> = Vec::new();
        for record in records {
            if &record.target_id != target {
                return Err(StoreError::PartitionMismatch {
                    expected: target.to_string(),
                    found: record.target_id.to_string(),
                });
            }
            if index.places.contains(&record.place_id) || !batch_ids.insert(&record.place_id) {
                summary.duplicates += 1;
                continue;
            }
            fresh.push(record.clone());
        }
        if fresh.is_empty() {
            return Ok(summary);
        }

        // Reviews land before the place row: the place row is the checkpoint,
        // so it must only appear once its reviews are durable.
        let review_owners: Vec<bool> = fresh
            .iter()
            .map(|r| !index.reviewed.contains(&r.place_id))
            .collect();
        let place_path = self.artifact_path(target, RecordKind::PlaceInfo);
        let review_path = self.artifact_path(target, RecordKind::Reviews);
        let (fresh, written_reviews) =
            tokio::task::spawn_blocking(move || -> Result<(Vec<PlaceRecord>, usize)> {
                let review_rows = fresh
                    .iter()
                    .zip(&review_owners)
                    .filter(|(_, owns)| **owns)
                    .flat_map(|(record, _)| {
                        record
                            .reviews
                            .iter()
                            .map(|review| ReviewRow::from_review(record.place_id.as_str(), review))
                    });
                let written = append_rows(&review_path, review_rows)?;
                Ok((fresh, written))
            })
            .await??;

        // Durable reviews are indexed even if the place row below fails, so a
        // retry of the same entity does not append them twice.
        for record in &fresh {
            if !record.reviews.is_empty() {
                index.reviewed.insert(record.place_id.clone());
            }
        }

        let fresh = tokio::task::spawn_blocking(move || -> Result<Vec<PlaceRecord>> {
            append_rows(&place_path, fresh.iter().map(PlaceRow::from_record))?;
            Ok(fresh)
        })
        .await??;

        for record in &fresh {
            index.places.insert(record.place_id.clone());
        }
        summary.places = fresh.len();
        summary.reviews = written_reviews;

        info!(
            target_id = %target,
            places = summary.places,
            reviews = summary.reviews,
            duplicates = summary.duplicates,
            "Records persisted"
        );
        Ok(summary)
    }

    async fn exists(&self, target: &TargetId, entity: &EntityId) -> Result<bool> {
        let partition = self.partition(target);
        let mut guard = partition.lock().await;
        let index = self.ensure_index(target, &mut guard).await?;
        Ok(index.places.contains(entity))
    }

    async fn persisted_entities(&self, target: &TargetId) -> Result<HashSet<EntityId>> {
        let partition = self.partition(target);
        let mut guard = partition.lock().await;
        let index = self.ensure_index(target, &mut guard).await?;
        Ok(index.places.clone())
    }

    async fn has_artifact(&self, target: &TargetId, kind: RecordKind) -> Result<bool> {
        let path = self.artifact_path(target, kind);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len() > 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

#[async_trait]
impl FailureLog for CsvStore {
    async fn load(&self, target: &TargetId) -> Result<Vec<FailureRecord>> {
        let partition = self.partition(target);
        let _guard = partition.lock().await;
        let path = self.artifact_path(target, RecordKind::Failures);
        tokio::task::spawn_blocking(move || read_failures(&path)).await?
    }

    async fn record(&self, failure: FailureRecord) -> Result<()> {
        let partition = self.partition(&failure.target_id);
        let _guard = partition.lock().await;
        let path = self.artifact_path(&failure.target_id, RecordKind::Failures);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut rows = read_failures(&path)?;
            rows.retain(|row| row.entity_id != failure.entity_id);
            rows.push(failure);
            rewrite_failures(&path, &rows)
        })
        .await?
    }

    async fn resolve(&self, target: &TargetId, entity: &EntityId) -> Result<bool> {
        let partition = self.partition(target);
        let _guard = partition.lock().await;
        let path = self.artifact_path(target, RecordKind::Failures);
        let entity = entity.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut rows = read_failures(&path)?;
            let before = rows.len();
            rows.retain(|row| row.entity_id != entity);
            if rows.len() == before {
                return Ok(false);
            }
            rewrite_failures(&path, &rows)?;
            Ok(true)
        })
        .await?
    }

    async fn targets(&self) -> Result<Vec<TargetId>> {
        let dir = self.root.join(RecordKind::Failures.dir());
        let prefix = format!("{}_", RecordKind::Failures.prefix());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut targets = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::io(&dir, e))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".csv"))
            else {
                continue;
            };
            let target = TargetId::new(stem);
            if !self.load(&target).await?.is_empty() {
                targets.push(target);
            }
        }
        targets.sort();
        Ok(targets)
    }
}

// ---------------------------------------------------------------------------
// Blocking file helpers
// ---------------------------------------------------------------------------

/// Target ids become part of a file name; anything outside `[A-Za-z0-9_-]`
/// is replaced.
fn file_stem(target: &TargetId) -> String {
    target
        .as_str()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Append rows, writing the header only when the file is absent or empty.
/// Returns the number of rows written.
fn append_rows<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<usize> {
    let mut rows = rows.into_iter().peekable();
    if rows.peek().is_none() {
        return Ok(0);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let needs_header = match fs::metadata(path) {
        Ok(meta) => meta.len() == 0,
        Err(_) => true,
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    let mut written = 0;
    for row in rows {
        writer.serialize(row).map_err(|e| StoreError::csv(path, e))?;
        written += 1;
    }
    let file = writer
        .into_inner()
        .map_err(|e| StoreError::io(path, e.into_error()))?;
    file.sync_data().map_err(|e| StoreError::io(path, e))?;
    Ok(written)
}

fn read_place_ids(path: &Path) -> Result<HashSet<EntityId>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let mut reader = csv::Reader::from_path(path).map_err(|e| StoreError::csv(path, e))?;
    let mut ids = HashSet::new();
    for row in reader.deserialize::<PlaceKey>() {
        let row = row.map_err(|e| StoreError::csv(path, e))?;
        ids.insert(EntityId::new(row.place_id));
    }
    Ok(ids)
}

fn read_failures(path: &Path) -> Result<Vec<FailureRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path).map_err(|e| StoreError::csv(path, e))?;
    reader
        .deserialize::<FailureRecord>()
        .map(|row| row.map_err(|e| StoreError::csv(path, e)))
        .collect()
}

/// Replace the failure log with `rows` via a sibling temp file and rename.
/// An empty snapshot removes the file.
fn rewrite_failures(path: &Path, rows: &[FailureRecord]) -> Result<()> {
    if rows.is_empty() {
        return match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        };
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp).map_err(|e| StoreError::csv(&tmp, e))?;
        for row in rows {
            writer.serialize(row).map_err(|e| StoreError::csv(&tmp, e))?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::io(&tmp, e.into_error()))?;
        file.sync_data().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}
