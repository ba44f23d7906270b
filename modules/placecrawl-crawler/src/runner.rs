//! Run driver: plan → schedule → fetch with retries → persist.
//!
//! `Crawler::run` plans targets and crawls what is not already on disk.
//! `Crawler::reprocess_failed` re-attempts only the entities in the failure
//! logs and removes each one from its log once its record is persisted.
//! Both finish with a [`RunStats`] summary logged under the run's span.

use std::fmt;
use std::slice;
use std::sync::Arc;

use tracing::{error, info, info_span, warn, Instrument};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use placecrawl_common::{FailureRecord, Target, WorkItem};
use placecrawl_store::{FailureLog, RecordSink};

use crate::orchestrator::ItemFetcher;
use crate::planner::{Acceptance, CandidateSource, Planner};
use crate::retry::{AttemptOutcome, FailureTracker, RetryPolicy};
use crate::scheduler::{GateSnapshot, Scheduler};

/// Long-lived collaborators for one crawl process.
#[derive(Clone, TypedBuilder)]
pub struct CrawlerDeps {
    pub sink: Arc<dyn RecordSink>,
    pub failures: Arc<dyn FailureLog>,
    pub fetcher: Arc<dyn ItemFetcher>,
    pub candidates: Arc<dyn CandidateSource>,
    pub policy: RetryPolicy,
    pub item_capacity: usize,
    pub phases_per_item: usize,
    pub context_limit: usize,
    #[builder(default)]
    pub acceptance: Acceptance,
    #[builder(default = 400)]
    pub candidate_limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub targets: usize,
    pub failed_targets: usize,
    pub planned: usize,
    pub skipped_existing: usize,
    pub succeeded: usize,
    pub insufficient: usize,
    pub exhausted: usize,
    /// Failure-log entries dropped because their place was already on disk.
    pub already_resolved: usize,
    pub peak_in_flight: usize,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Crawl Complete ===")?;
        writeln!(f, "Targets:          {} ({} failed lookup)", self.targets, self.failed_targets)?;
        writeln!(f, "Planned items:    {}", self.planned)?;
        writeln!(f, "Already on disk:  {}", self.skipped_existing)?;
        writeln!(f, "Succeeded:        {}", self.succeeded)?;
        writeln!(f, "Insufficient:     {}", self.insufficient)?;
        writeln!(f, "Exhausted:        {}", self.exhausted)?;
        if self.already_resolved > 0 {
            writeln!(f, "Resolved in log:  {}", self.already_resolved)?;
        }
        write!(f, "Peak in flight:   {}", self.peak_in_flight)
    }
}

/// What happened to one admitted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Persisted,
    Insufficient,
    Exhausted,
}

pub struct Crawler {
    deps: CrawlerDeps,
    scheduler: Scheduler,
    tracker: FailureTracker,
    run_id: Uuid,
}

impl Crawler {
    pub fn new(deps: CrawlerDeps) -> placecrawl_common::Result<Self> {
        let scheduler = Scheduler::new(deps.item_capacity, deps.phases_per_item, deps.context_limit)?;
        let tracker = FailureTracker::new(deps.policy.clone(), deps.failures.clone());
        Ok(Self {
            deps,
            scheduler,
            tracker,
            run_id: Uuid::new_v4(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn gate(&self) -> GateSnapshot {
        self.scheduler.snapshot()
    }

    pub async fn run(&self, targets: &[Target]) -> RunStats {
        let span = info_span!("crawl_run", run_id = %self.run_id, mode = "crawl");
        async {
            info!(targets = targets.len(), "Crawl starting");
            let planner = Planner::new(
                self.deps.candidates.clone(),
                self.deps.sink.clone(),
                self.deps.acceptance.clone(),
                self.deps.candidate_limit,
            );
            let plan = planner.plan(targets).await;

            let mut stats = RunStats {
                targets: targets.len(),
                failed_targets: plan.failed_targets.len(),
                skipped_existing: plan.skipped_existing,
                ..Default::default()
            };
            for (target, err) in &plan.failed_targets {
                warn!(target_id = %target, error = %err, "Target not crawled");
            }

            self.process(plan.items, &mut stats).await;
            self.finish(&stats).await;
            stats
        }
        .instrument(span)
        .await
    }

    pub async fn reprocess_failed(&self) -> placecrawl_common::Result<RunStats> {
        let span = info_span!("crawl_run", run_id = %self.run_id, mode = "reprocess");
        async {
            let targets = self.deps.failures.targets().await?;
            info!(targets = targets.len(), "Reprocessing failure logs");

            let mut stats = RunStats {
                targets: targets.len(),
                ..Default::default()
            };
            let mut items = Vec::new();
            for target in &targets {
                let rows = self.deps.failures.load(target).await?;
                let persisted = self.deps.sink.persisted_entities(target).await?;
                for row in rows {
                    if persisted.contains(&row.entity_id) {
                        self.deps.failures.resolve(target, &row.entity_id).await?;
                        stats.already_resolved += 1;
                        continue;
                    }
                    items.push(row.work_item());
                }
            }

            self.process(items, &mut stats).await;
            self.finish(&stats).await;
            Ok::<_, placecrawl_common::CrawlError>(stats)
        }
        .instrument(span)
        .await
    }

    async fn process(&self, items: Vec<WorkItem>, stats: &mut RunStats) {
        stats.planned += items.len();
        let outcomes = self
            .scheduler
            .run(items, |item| async move { self.process_item(&item).await })
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(ItemOutcome::Persisted) => stats.succeeded += 1,
                Ok(ItemOutcome::Insufficient) => stats.insufficient += 1,
                Ok(ItemOutcome::Exhausted) => stats.exhausted += 1,
                Err(e) => {
                    error!(error = %e, "Item was never admitted");
                    stats.exhausted += 1;
                }
            }
        }
        stats.peak_in_flight = stats.peak_in_flight.max(self.scheduler.snapshot().peak);
    }

    async fn process_item(&self, item: &WorkItem) -> ItemOutcome {
        match self.tracker.attempt(item, self.deps.fetcher.as_ref()).await {
            AttemptOutcome::Success(record) => {
                if let Err(e) = self
                    .deps
                    .sink
                    .write(&record.target_id, slice::from_ref(&record))
                    .await
                {
                    error!(
                        target_id = %item.target_id,
                        entity = %item.entity_id,
                        error = %e,
                        "Failed to persist record"
                    );
                    let failure = FailureRecord::new(item, format!("storage: {e}"));
                    if let Err(e) = self.deps.failures.record(failure).await {
                        error!(entity = %item.entity_id, error = %e, "Failed to record failure");
                    }
                    return ItemOutcome::Exhausted;
                }
                self.resolve_failure(item).await;
                ItemOutcome::Persisted
            }
            AttemptOutcome::Skipped(_) => {
                // Not retryable, so it has no place in the failure log.
                self.resolve_failure(item).await;
                ItemOutcome::Insufficient
            }
            AttemptOutcome::Exhausted(_) => ItemOutcome::Exhausted,
        }
    }

    async fn resolve_failure(&self, item: &WorkItem) {
        if let Err(e) = self
            .deps
            .failures
            .resolve(&item.target_id, &item.entity_id)
            .await
        {
            warn!(entity = %item.entity_id, error = %e, "Failed to update failure log");
        }
    }

    async fn finish(&self, stats: &RunStats) {
        let gate = self.scheduler.snapshot();
        info!(
            planned = stats.planned,
            succeeded = stats.succeeded,
            insufficient = stats.insufficient,
            exhausted = stats.exhausted,
            skipped_existing = stats.skipped_existing,
            failed_targets = stats.failed_targets,
            acquired = gate.acquired,
            released = gate.released,
            peak = gate.peak,
            "{stats}"
        );
        match self.deps.failures.targets().await {
            Ok(pending) if !pending.is_empty() => warn!(
                targets = pending.len(),
                "Failure logs are non-empty; run retry-failed to reprocess"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not list failure logs"),
        }
    }
}
