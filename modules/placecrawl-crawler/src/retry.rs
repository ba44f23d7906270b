// Retry & failure tracking around one item's fetch.
//
// Every attempt runs under the item timeout. Timeouts and hard failures are
// retried after a fixed pause until `max_retries` attempts have been made;
// insufficient content is returned at once. Exhaustion produces exactly one
// FailureRecord, upserted into the target's failure log.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use placecrawl_common::file_config::CrawlConfig;
use placecrawl_common::{FailureKind, FailureRecord, ItemRecord, PlaceRecord, WorkItem};
use placecrawl_store::FailureLog;

use crate::orchestrator::ItemFetcher;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub item_timeout: Duration,
    /// Total attempts, first try included.
    pub max_retries: u32,
    pub pause: Duration,
}

impl RetryPolicy {
    pub fn from_config(crawl: &CrawlConfig) -> Self {
        Self {
            item_timeout: crawl.item_timeout(),
            max_retries: crawl.max_retries,
            pause: crawl.retry_pause(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(PlaceRecord),
    /// Not worth retrying (quality gate); never logged as a failure.
    Skipped(FailureKind),
    Exhausted(FailureRecord),
}

pub struct FailureTracker {
    policy: RetryPolicy,
    log: Arc<dyn FailureLog>,
}

impl FailureTracker {
    pub fn new(policy: RetryPolicy, log: Arc<dyn FailureLog>) -> Self {
        Self { policy, log }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn attempt(&self, item: &WorkItem, fetcher: &dyn ItemFetcher) -> AttemptOutcome {
        let attempts = self.policy.max_retries.max(1);
        let mut last = FailureKind::TimedOut { phase: None };

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.policy.item_timeout, fetcher.fetch(item)).await {
                Ok(ItemRecord::Complete(record)) => {
                    if attempt > 1 {
                        info!(
                            target_id = %item.target_id,
                            entity = %item.entity_id,
                            attempt,
                            "Succeeded after retry"
                        );
                    }
                    return AttemptOutcome::Success(record);
                }
                Ok(ItemRecord::Failed(failure)) if !failure.kind.is_retryable() => {
                    info!(
                        target_id = %item.target_id,
                        entity = %item.entity_id,
                        reason = %failure.kind,
                        "Skipping item"
                    );
                    return AttemptOutcome::Skipped(failure.kind);
                }
                Ok(ItemRecord::Failed(failure)) => last = failure.kind,
                Err(_) => last = FailureKind::TimedOut { phase: None },
            }

            warn!(
                target_id = %item.target_id,
                entity = %item.entity_id,
                attempt,
                max_attempts = attempts,
                reason = %last,
                "Attempt failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.policy.pause).await;
            }
        }

        let record = FailureRecord::new(item, last.to_string());
        if let Err(e) = self.log.record(record.clone()).await {
            error!(
                target_id = %item.target_id,
                entity = %item.entity_id,
                error = %e,
                "Failed to record failure"
            );
        }
        AttemptOutcome::Exhausted(record)
    }
}
