//! Bounded admission of items.
//!
//! A fixed-size gate hands out [`Slot`]s; an item holds one for as long as its
//! orchestration runs. The slot is released by `Drop`, so success, error,
//! panic unwinding and cancellation all give it back. Acquire/release counts
//! and peak occupancy are tracked for the end-of-run report.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use placecrawl_common::{CrawlError, Result};

pub struct Scheduler {
    gate: Arc<Semaphore>,
    capacity: usize,
    stats: Arc<GateStats>,
}

#[derive(Debug, Default)]
struct GateStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub capacity: usize,
    pub in_flight: usize,
    pub peak: usize,
    pub acquired: usize,
    pub released: usize,
}

impl Scheduler {
    /// Rejects plans whose items could together need more browsing contexts
    /// than the pool holds.
    pub fn new(capacity: usize, phases_per_item: usize, context_limit: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(CrawlError::Config("scheduler capacity must be at least 1".into()));
        }
        let needed = capacity.saturating_mul(phases_per_item);
        if needed > context_limit {
            return Err(CrawlError::Config(format!(
                "{capacity} items x {phases_per_item} phases needs {needed} contexts, \
                 pool holds {context_limit}"
            )));
        }
        info!(capacity, phases_per_item, context_limit, "Scheduler ready");
        Ok(Self {
            gate: Arc::new(Semaphore::new(capacity)),
            capacity,
            stats: Arc::new(GateStats::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn admit(&self) -> Result<Slot> {
        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::Config("admission gate closed".into()))?;

        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Slot {
            stats: self.stats.clone(),
            _permit: permit,
        })
    }

    /// Run `f` for every item, at most `capacity` at once, each under a slot.
    /// Results come back in completion order.
    pub async fn run<T, F, Fut>(&self, items: Vec<T>, f: F) -> Vec<Result<Fut::Output>>
    where
        F: Fn(T) -> Fut,
        Fut: Future,
    {
        let f = &f;
        stream::iter(items)
            .map(|item| async move {
                let _slot = self.admit().await?;
                Ok::<_, CrawlError>(f(item).await)
            })
            .buffer_unordered(self.capacity)
            .collect()
            .await
    }

    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            capacity: self.capacity,
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
            peak: self.stats.peak.load(Ordering::SeqCst),
            acquired: self.stats.acquired.load(Ordering::SeqCst),
            released: self.stats.released.load(Ordering::SeqCst),
        }
    }
}

/// One admitted item. Counters update before the permit is returned.
pub struct Slot {
    stats: Arc<GateStats>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}
