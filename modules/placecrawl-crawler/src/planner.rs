// Target planning and the resumability filter.
//
// Target → candidate ids (from the CandidateSource) minus the ids that already
// have a place row in the sink. Presence of the row is the whole checkpoint:
// there is no content re-verification. A target whose lookup fails is logged
// and skipped; the rest of the run continues.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use placecrawl_common::file_config::AcceptanceConfig;
use placecrawl_common::{Candidate, CrawlError, EntityId, Target, TargetId, WorkItem};
use placecrawl_store::RecordSink;

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Up to `max_count` accepted candidates for one target.
    async fn search(
        &self,
        target: &Target,
        max_count: usize,
        acceptance: &Acceptance,
    ) -> anyhow::Result<Vec<Candidate>>;
}

/// Listing-level gate applied before a candidate becomes work.
#[derive(Debug, Clone, Default)]
pub struct Acceptance {
    /// Substrings; a candidate passes when its category contains any of them.
    /// Empty accepts everything.
    pub categories: Vec<String>,
    pub min_review_count: u32,
    pub min_rating: f32,
}

impl Acceptance {
    pub fn from_config(config: &AcceptanceConfig) -> Self {
        Self {
            categories: config.categories.clone(),
            min_review_count: config.min_review_count,
            min_rating: config.min_rating,
        }
    }

    pub fn accepts(&self, candidate: &Candidate) -> bool {
        let category_ok = self.categories.is_empty()
            || candidate
                .category
                .as_deref()
                .is_some_and(|c| self.categories.iter().any(|allowed| c.contains(allowed.as_str())));
        let reviews_ok =
            self.min_review_count == 0 || candidate.review_count.unwrap_or(0) >= self.min_review_count;
        let rating_ok = self.min_rating <= 0.0 || candidate.rating.unwrap_or(0.0) >= self.min_rating;
        category_ok && reviews_ok && rating_ok
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    pub items: Vec<WorkItem>,
    pub skipped_existing: usize,
    pub failed_targets: Vec<(TargetId, CrawlError)>,
}

pub struct Planner {
    source: Arc<dyn CandidateSource>,
    sink: Arc<dyn RecordSink>,
    acceptance: Acceptance,
    candidate_limit: usize,
}

impl Planner {
    pub fn new(
        source: Arc<dyn CandidateSource>,
        sink: Arc<dyn RecordSink>,
        acceptance: Acceptance,
        candidate_limit: usize,
    ) -> Self {
        Self {
            source,
            sink,
            acceptance,
            candidate_limit,
        }
    }

    pub async fn plan(&self, targets: &[Target]) -> Plan {
        let mut plan = Plan::default();
        let mut seen: HashSet<(TargetId, EntityId)> = HashSet::new();

        for target in targets {
            let candidates = match self
                .source
                .search(target, self.candidate_limit, &self.acceptance)
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(target_id = %target.id, error = %e, "Candidate lookup failed, skipping target");
                    plan.failed_targets.push((
                        target.id.clone(),
                        CrawlError::Lookup {
                            target: target.id.clone(),
                            message: format!("{e:#}"),
                        },
                    ));
                    continue;
                }
            };

            let persisted = match self.sink.persisted_entities(&target.id).await {
                Ok(persisted) => persisted,
                Err(e) => {
                    warn!(target_id = %target.id, error = %e, "Could not read existing output, skipping target");
                    plan.failed_targets.push((target.id.clone(), e.into()));
                    continue;
                }
            };

            let mut planned = 0;
            let mut skipped = 0;
            for candidate in candidates.into_iter().take(self.candidate_limit) {
                if !seen.insert((target.id.clone(), candidate.entity_id.clone())) {
                    continue;
                }
                if persisted.contains(&candidate.entity_id) {
                    info!(
                        target_id = %target.id,
                        entity = %candidate.entity_id,
                        name = candidate.name.as_str(),
                        "Already persisted, skipping"
                    );
                    skipped += 1;
                    continue;
                }
                plan.items
                    .push(WorkItem::new(target.id.clone(), candidate.entity_id, candidate.name));
                planned += 1;
            }

            plan.skipped_existing += skipped;
            info!(
                target_id = %target.id,
                search_key = target.search_key.as_str(),
                planned,
                skipped,
                "Target planned"
            );
        }

        plan
    }
}
