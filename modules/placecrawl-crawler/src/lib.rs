pub mod browser;
pub mod extractor;
pub mod loader;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod search;
pub mod targets;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use browser::{BrowsingContext, ContextFactory, ContextPool, PooledContext};
pub use extractor::{PageExtractor, SelectorExtractor};
pub use loader::{ContentLoader, ExpandableList, LoadOutcome, StopReason};
pub use orchestrator::{ItemFetcher, Orchestrator, PhaseSettings};
pub use planner::{Acceptance, CandidateSource, Plan, Planner};
pub use retry::{AttemptOutcome, FailureTracker, RetryPolicy};
pub use runner::{Crawler, CrawlerDeps, RunStats};
pub use scheduler::{GateSnapshot, Scheduler, Slot};
