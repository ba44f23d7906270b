//! Per-item fetch: every configured phase runs concurrently in its own pooled
//! browsing context, and the results are merged all-or-nothing.
//!
//! A phase is: block resources → navigate → wait for the ready selector →
//! best-effort expand clicks → expand the phase's list (if any) → extract.
//! Each phase is bounded by `phase_timeout`. Contexts are closed before the
//! merged outcome is returned, whatever the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use placecrawl_common::file_config::{CrawlConfig, ResourceKind, SiteConfig};
use placecrawl_common::{
    FailureKind, ItemFailure, ItemRecord, PhaseKind, PhaseResult, PlaceRecord, WorkItem,
};

use crate::browser::{BrowsingContext, ContextPool};
use crate::extractor::PageExtractor;
use crate::loader::{ContentLoader, PageList};

/// Anything that turns a WorkItem into a merged record. The retry tracker
/// and the runner only see this seam.
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    async fn fetch(&self, item: &WorkItem) -> ItemRecord;
}

/// Per-phase limits and request blocking.
#[derive(Debug, Clone)]
pub struct PhaseSettings {
    pub phase_timeout: Duration,
    pub ready_timeout: Duration,
    pub block: Vec<ResourceKind>,
}

impl PhaseSettings {
    pub fn from_config(crawl: &CrawlConfig) -> Self {
        Self {
            phase_timeout: crawl.phase_timeout(),
            ready_timeout: crawl.ready_timeout(),
            block: crawl.block_resources.clone(),
        }
    }
}

pub struct Orchestrator {
    pool: ContextPool,
    extractor: Arc<dyn PageExtractor>,
    site: Arc<SiteConfig>,
    loader: ContentLoader,
    settings: PhaseSettings,
    phases: Vec<PhaseKind>,
}

impl Orchestrator {
    pub fn new(
        pool: ContextPool,
        extractor: Arc<dyn PageExtractor>,
        site: Arc<SiteConfig>,
        loader: ContentLoader,
        settings: PhaseSettings,
    ) -> Self {
        let phases = site.phases();
        Self {
            pool,
            extractor,
            site,
            loader,
            settings,
            phases,
        }
    }

    pub fn phases(&self) -> &[PhaseKind] {
        &self.phases
    }

    /// One phase in its own context, bounded by the phase timeout. The
    /// context is closed explicitly on every path that returns here.
    async fn run_phase(&self, item: &WorkItem, kind: PhaseKind) -> PhaseResult {
        let started = Instant::now();
        let timeout = self.settings.phase_timeout;

        let pooled = match tokio::time::timeout(timeout, self.pool.acquire()).await {
            Ok(Ok(pooled)) => pooled,
            Ok(Err(e)) => return PhaseResult::Failed(format!("no browsing context: {e:#}")),
            Err(_) => return PhaseResult::TimedOut,
        };

        let result = match tokio::time::timeout(timeout, self.drive(pooled.context(), item, kind)).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => PhaseResult::Failed(format!("{e:#}")),
            Err(_) => PhaseResult::TimedOut,
        };
        pooled.close().await;

        debug!(
            target_id = %item.target_id,
            entity = %item.entity_id,
            phase = %kind,
            outcome = phase_label(&result),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Phase finished"
        );
        result
    }

    async fn drive(
        &self,
        context: &dyn BrowsingContext,
        item: &WorkItem,
        kind: PhaseKind,
    ) -> Result<PhaseResult> {
        let page = self
            .site
            .page(kind)
            .ok_or_else(|| anyhow!("{kind} phase is not configured"))?;

        if !self.settings.block.is_empty() {
            context.block_resources(&self.settings.block).await?;
        }
        context.navigate(&page.url_for(&item.entity_id)).await?;

        if let Some(ready) = &page.ready {
            if !context.wait_for(ready, self.settings.ready_timeout).await? {
                return Err(anyhow!("ready selector {ready:?} never appeared"));
            }
        }

        for control in &page.expand {
            match context.click(control).await {
                Ok(true) => debug!(entity = %item.entity_id, phase = %kind, control, "Expanded"),
                Ok(false) => {}
                Err(e) => debug!(entity = %item.entity_id, control, error = %e, "Expand click failed"),
            }
        }

        if let Some(list) = &page.list {
            let outcome = self
                .loader
                .expand(&PageList::new(context, list), list.max_rounds, list.target_count)
                .await?;
            debug!(
                entity = %item.entity_id,
                phase = %kind,
                rounds = outcome.rounds,
                items = outcome.items,
                reached_target = outcome.reached_target,
                "List loaded"
            );
        }

        Ok(self.extractor.extract(context, kind, &item.entity_id).await)
    }
}

#[async_trait]
impl ItemFetcher for Orchestrator {
    async fn fetch(&self, item: &WorkItem) -> ItemRecord {
        let started = Instant::now();
        let runs = self.phases.iter().map(|&kind| async move {
            (kind, self.run_phase(item, kind).await)
        });
        let results = join_all(runs).await;
        let record = merge(item, results);

        match &record {
            ItemRecord::Complete(place) => info!(
                target_id = %item.target_id,
                entity = %item.entity_id,
                reviews = place.reviews.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Item fetched"
            ),
            ItemRecord::Failed(failure) => warn!(
                target_id = %item.target_id,
                entity = %item.entity_id,
                reason = %failure.kind,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Item failed"
            ),
        }
        record
    }
}

/// All phases succeeded → union of payloads. Otherwise the first hard
/// failure (timeout or error) in phase order wins over an insufficient phase,
/// since only hard failures are retried.
pub fn merge(item: &WorkItem, results: Vec<(PhaseKind, PhaseResult)>) -> ItemRecord {
    let mut payloads = Vec::with_capacity(results.len());
    let mut hard: Option<FailureKind> = None;
    let mut soft: Option<FailureKind> = None;

    for (phase, result) in results {
        match result {
            PhaseResult::Success(payload) => payloads.push(payload),
            PhaseResult::TimedOut => {
                hard.get_or_insert(FailureKind::TimedOut { phase: Some(phase) });
            }
            PhaseResult::Failed(message) => {
                hard.get_or_insert(FailureKind::Error {
                    phase: Some(phase),
                    message,
                });
            }
            PhaseResult::Insufficient(reason) => {
                soft.get_or_insert(FailureKind::Insufficient { phase, reason });
            }
        }
    }

    match hard.or(soft) {
        Some(kind) => ItemRecord::Failed(ItemFailure {
            item: item.clone(),
            kind,
        }),
        None => ItemRecord::Complete(PlaceRecord::from_payloads(item, payloads, Utc::now())),
    }
}

fn phase_label(result: &PhaseResult) -> &'static str {
    match result {
        PhaseResult::Success(_) => "success",
        PhaseResult::Insufficient(_) => "insufficient",
        PhaseResult::TimedOut => "timed_out",
        PhaseResult::Failed(_) => "failed",
    }
}
