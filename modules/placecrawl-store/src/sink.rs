// Persistence contracts consumed by the crawler.
//
// RecordSink   — append-only per-target output; presence of a place row is
//                the only resumability marker.
// FailureLog   — per-target snapshot of items that exhausted their retries.

use std::collections::HashSet;

use async_trait::async_trait;

use placecrawl_common::{EntityId, FailureRecord, PlaceRecord, TargetId};

use crate::error::Result;

/// Artifact families kept per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    PlaceInfo,
    Reviews,
    Failures,
}

impl RecordKind {
    pub const OUTPUT: [RecordKind; 2] = [RecordKind::PlaceInfo, RecordKind::Reviews];

    /// Directory under the data root.
    pub fn dir(&self) -> &'static str {
        match self {
            RecordKind::PlaceInfo => "place_info",
            RecordKind::Reviews => "reviews",
            RecordKind::Failures => "failed_places",
        }
    }

    /// File name prefix, joined to the target id with `_`.
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordKind::PlaceInfo => "place_info",
            RecordKind::Reviews => "reviews",
            RecordKind::Failures => "failed",
        }
    }
}

/// What a `write` call actually appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub places: usize,
    pub reviews: usize,
    /// Records skipped because their entity was already persisted.
    pub duplicates: usize,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Durably append finished places for one target. Idempotent: entities
    /// that already have a place row are skipped.
    async fn write(&self, target: &TargetId, records: &[PlaceRecord]) -> Result<WriteSummary>;

    /// Whether a place row exists for this entity.
    async fn exists(&self, target: &TargetId, entity: &EntityId) -> Result<bool>;

    /// Every entity with a place row in this target.
    async fn persisted_entities(&self, target: &TargetId) -> Result<HashSet<EntityId>>;

    /// Whether the artifact file for this kind exists and is non-empty.
    async fn has_artifact(&self, target: &TargetId, kind: RecordKind) -> Result<bool>;
}

#[async_trait]
pub trait FailureLog: Send + Sync {
    /// Current failures for a target. Empty when there is no log.
    async fn load(&self, target: &TargetId) -> Result<Vec<FailureRecord>>;

    /// Insert or replace the entry for this entity.
    async fn record(&self, failure: FailureRecord) -> Result<()>;

    /// Drop the entry for this entity. Returns whether one was present.
    async fn resolve(&self, target: &TargetId, entity: &EntityId) -> Result<bool>;

    /// Targets whose failure log is non-empty.
    async fn targets(&self) -> Result<Vec<TargetId>>;
}
