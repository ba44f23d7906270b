//! Incremental expansion of lazily-rendered lists.
//!
//! Each round reads the rendered item count, scrolls the list to its end and
//! waits for rendering. When the list has a "load more" control it is clicked
//! and the count re-polled; no growth after the re-polls means the list is
//! exhausted. Without a control, an unchanged scroll extent means the same.
//! `max_rounds` bounds the loop regardless of what the page does.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use placecrawl_common::file_config::{ListSpec, LoaderConfig};

use crate::browser::BrowsingContext;

#[async_trait]
pub trait ExpandableList: Send + Sync {
    async fn item_count(&self) -> Result<usize>;

    /// Scroll to the end, returning the resulting scroll extent.
    async fn scroll_to_end(&self) -> Result<u64>;

    /// Activate the "load more" control. `false` when the list has none, or
    /// it is not present right now.
    async fn activate_load_more(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    Converged,
    MaxRounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub reached_target: bool,
    pub rounds: u32,
    pub items: usize,
    pub stop: StopReason,
}

#[derive(Debug, Clone)]
pub struct ContentLoader {
    pacing: LoaderConfig,
}

impl ContentLoader {
    pub fn new(pacing: LoaderConfig) -> Self {
        Self { pacing }
    }

    pub async fn expand(
        &self,
        list: &dyn ExpandableList,
        max_rounds: u32,
        target_count: Option<usize>,
    ) -> Result<LoadOutcome> {
        let reached = |items: usize| target_count.is_some_and(|target| items >= target);
        let mut last_extent: Option<u64> = None;

        for round in 1..=max_rounds {
            let items = list.item_count().await?;
            if reached(items) {
                return Ok(self.finish(round, items, StopReason::TargetReached, true));
            }

            let extent = list.scroll_to_end().await?;
            self.pause(self.pacing.scroll_pause_ms).await;

            if list.activate_load_more().await? {
                if !self.grew_after_click(list, items).await? {
                    let items = list.item_count().await?;
                    return Ok(self.finish(round, items, StopReason::Converged, reached(items)));
                }
            } else if last_extent == Some(extent) {
                let items = list.item_count().await?;
                return Ok(self.finish(round, items, StopReason::Converged, reached(items)));
            }
            last_extent = Some(extent);
        }

        let items = list.item_count().await?;
        Ok(self.finish(max_rounds, items, StopReason::MaxRounds, reached(items)))
    }

    /// Re-poll the count after a click until it moves past `before`.
    async fn grew_after_click(&self, list: &dyn ExpandableList, before: usize) -> Result<bool> {
        for _ in 0..self.pacing.repolls.max(1) {
            self.pause(self.pacing.repoll_pause_ms).await;
            if list.item_count().await? > before {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn finish(&self, rounds: u32, items: usize, stop: StopReason, reached_target: bool) -> LoadOutcome {
        debug!(rounds, items, ?stop, reached_target, "List expansion finished");
        LoadOutcome {
            reached_target,
            rounds,
            items,
            stop,
        }
    }

    async fn pause(&self, base_ms: u64) {
        let jitter = if self.pacing.jitter_ms > 0 {
            rand::rng().random_range(0..=self.pacing.jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}

/// A configured list on an open browsing context.
pub struct PageList<'a> {
    context: &'a dyn BrowsingContext,
    spec: &'a ListSpec,
}

impl<'a> PageList<'a> {
    pub fn new(context: &'a dyn BrowsingContext, spec: &'a ListSpec) -> Self {
        Self { context, spec }
    }
}

#[async_trait]
impl ExpandableList for PageList<'_> {
    async fn item_count(&self) -> Result<usize> {
        self.context.count(&self.spec.item).await
    }

    async fn scroll_to_end(&self) -> Result<u64> {
        self.context.scroll_to_end(self.spec.container.as_deref()).await
    }

    async fn activate_load_more(&self) -> Result<bool> {
        match &self.spec.load_more {
            Some(selector) => self.context.click(selector).await,
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Count grows by `step` per click until `cap`; extent follows count.
    struct ClickList {
        count: Mutex<usize>,
        step: usize,
        cap: usize,
        has_control: bool,
    }

    #[async_trait]
    impl ExpandableList for ClickList {
        async fn item_count(&self) -> Result<usize> {
            Ok(*self.count.lock().unwrap())
        }
        async fn scroll_to_end(&self) -> Result<u64> {
            Ok(*self.count.lock().unwrap() as u64 * 100)
        }
        async fn activate_load_more(&self) -> Result<bool> {
            if !self.has_control {
                return Ok(false);
            }
            let mut count = self.count.lock().unwrap();
            *count = (*count + self.step).min(self.cap);
            Ok(true)
        }
    }

    struct ExtentList {
        extents: Mutex<VecDeque<u64>>,
    }

    #[async_trait]
    impl ExpandableList for ExtentList {
        async fn item_count(&self) -> Result<usize> {
            Ok(0)
        }
        async fn scroll_to_end(&self) -> Result<u64> {
            let mut extents = self.extents.lock().unwrap();
            let next = if extents.len() > 1 {
                extents.pop_front().unwrap()
            } else {
                *extents.front().unwrap()
            };
            Ok(next)
        }
        async fn activate_load_more(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn loader() -> ContentLoader {
        ContentLoader::new(LoaderConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_target_count_reached() {
        let list = ClickList {
            count: Mutex::new(10),
            step: 10,
            cap: 1_000,
            has_control: true,
        };
        let outcome = loader().expand(&list, 20, Some(35)).await.unwrap();
        assert!(outcome.reached_target);
        assert_eq!(outcome.stop, StopReason::TargetReached);
        assert_eq!(outcome.items, 40);
        assert_eq!(outcome.rounds, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn click_without_growth_converges() {
        let list = ClickList {
            count: Mutex::new(10),
            step: 10,
            cap: 30,
            has_control: true,
        };
        let outcome = loader().expand(&list, 20, Some(100)).await.unwrap();
        assert!(!outcome.reached_target);
        assert_eq!(outcome.stop, StopReason::Converged);
        assert_eq!(outcome.items, 30);
        assert_eq!(outcome.rounds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_extent_without_control_converges() {
        let list = ExtentList {
            extents: Mutex::new(VecDeque::from([1_000, 2_000, 3_000, 3_000])),
        };
        let outcome = loader().expand(&list, 20, None).await.unwrap();
        assert_eq!(outcome.stop, StopReason::Converged);
        assert_eq!(outcome.rounds, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_rounds() {
        let list = ClickList {
            count: Mutex::new(0),
            step: 1,
            cap: usize::MAX,
            has_control: true,
        };
        let outcome = loader().expand(&list, 5, None).await.unwrap();
        assert_eq!(outcome.stop, StopReason::MaxRounds);
        assert_eq!(outcome.rounds, 5);
        assert_eq!(outcome.items, 5);
    }
}
