//! Whole-run behavior with a scripted fetcher: admission stays within
//! capacity, every slot is released, failure logs are reprocessed.

use std::sync::Arc;
use std::time::Duration;

use placecrawl_common::{FailureKind, PhaseKind, Target};
use placecrawl_crawler::testing::{
    candidate, MemoryStore, MockCandidateSource, Scripted, ScriptedFetcher,
};
use placecrawl_crawler::{Crawler, CrawlerDeps, RetryPolicy, Scheduler};

fn policy() -> RetryPolicy {
    RetryPolicy {
        item_timeout: Duration::from_secs(120),
        max_retries: 3,
        pause: Duration::from_secs(2),
    }
}

fn crawler(
    store: Arc<MemoryStore>,
    fetcher: Arc<ScriptedFetcher>,
    source: MockCandidateSource,
    capacity: usize,
) -> Crawler {
    let deps = CrawlerDeps::builder()
        .sink(store.clone())
        .failures(store)
        .fetcher(fetcher)
        .candidates(Arc::new(source))
        .policy(policy())
        .item_capacity(capacity)
        .phases_per_item(3)
        .context_limit(capacity * 3)
        .build();
    Crawler::new(deps).unwrap()
}

fn broken() -> Scripted {
    Scripted::Fail(FailureKind::Error {
        phase: None,
        message: "page crashed".into(),
    })
}

#[tokio::test(start_paused = true)]
async fn in_flight_never_exceeds_capacity() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(ScriptedFetcher::new().with_delay(Duration::from_millis(250)));
    let source = MockCandidateSource::new()
        .on_target("A", (0..12).map(|n| candidate(&format!("a{n}"))).collect())
        .on_target("B", (0..8).map(|n| candidate(&format!("b{n}"))).collect());
    let crawler = crawler(store.clone(), fetcher.clone(), source, 3);

    let stats = crawler
        .run(&[Target::new("A", "a"), Target::new("B", "b")])
        .await;

    assert_eq!(stats.planned, 20);
    assert_eq!(stats.succeeded, 20);
    assert!(fetcher.peak() <= 3, "peak was {}", fetcher.peak());
    assert!(stats.peak_in_flight <= 3);

    let gate = crawler.gate();
    assert_eq!(gate.acquired, 20);
    assert_eq!(gate.released, 20);
    assert_eq!(gate.in_flight, 0);
    assert_eq!(store.places("A").len(), 12);
    assert_eq!(store.places("B").len(), 8);
}

#[tokio::test(start_paused = true)]
async fn failing_items_do_not_block_others() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .with_delay(Duration::from_millis(100))
            .script("2", vec![broken(), broken(), broken()]),
    );
    let source = MockCandidateSource::new()
        .on_target("A", vec![candidate("1"), candidate("2"), candidate("3")]);
    let crawler = crawler(store.clone(), fetcher.clone(), source, 2);

    let stats = crawler.run(&[Target::new("A", "a")]).await;

    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.exhausted, 1);
    assert_eq!(fetcher.calls("2"), 3);
    let failures = store.failures("A");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].entity_id.as_str(), "2");
    assert_eq!(crawler.gate().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn reprocess_resolves_recovered_and_persisted_entries() {
    let store = Arc::new(
        MemoryStore::new()
            .with_failure("A", "1", "reviews phase timed out")
            .with_failure("A", "2", "item timed out")
            .with_place("A", "2")
            .with_failure("B", "9", "home phase failed: blank page"),
    );
    let fetcher = Arc::new(ScriptedFetcher::new());
    let crawler = crawler(store.clone(), fetcher.clone(), MockCandidateSource::new(), 2);

    let stats = crawler.reprocess_failed().await.unwrap();

    assert_eq!(stats.targets, 2);
    assert_eq!(stats.already_resolved, 1);
    assert_eq!(stats.planned, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(fetcher.calls("2"), 0);
    assert_eq!(fetcher.calls("1"), 1);
    assert!(store.failures("A").is_empty());
    assert!(store.failures("B").is_empty());
    assert_eq!(store.places("A").len(), 2);
    assert_eq!(store.places("B").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reprocess_keeps_a_single_row_for_still_failing_entity() {
    let store = Arc::new(MemoryStore::new().with_failure("A", "1", "item timed out"));
    let fetcher = Arc::new(ScriptedFetcher::new().script("1", vec![broken(), broken(), broken()]));
    let crawler = crawler(store.clone(), fetcher, MockCandidateSource::new(), 1);

    let stats = crawler.reprocess_failed().await.unwrap();

    assert_eq!(stats.exhausted, 1);
    let failures = store.failures("A");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, "item failed: page crashed");
}

#[tokio::test(start_paused = true)]
async fn reprocess_drops_entity_that_turns_out_insufficient() {
    let store = Arc::new(MemoryStore::new().with_failure("A", "1", "reviews phase timed out"));
    let fetcher = Arc::new(ScriptedFetcher::new().script(
        "1",
        vec![Scripted::Fail(FailureKind::Insufficient {
            phase: PhaseKind::Reviews,
            reason: "2 reviews, need 5".into(),
        })],
    ));
    let crawler = crawler(store.clone(), fetcher.clone(), MockCandidateSource::new(), 1);

    let stats = crawler.reprocess_failed().await.unwrap();

    assert_eq!(stats.planned, 1);
    assert_eq!(stats.insufficient, 1);
    assert_eq!(fetcher.calls("1"), 1);
    assert!(store.failures("A").is_empty());
    assert!(store.places("A").is_empty());

    // Nothing is left to reprocess.
    let again = crawler.reprocess_failed().await.unwrap();
    assert_eq!(again.planned, 0);
    assert_eq!(fetcher.calls("1"), 1);
}

#[test]
fn overcommitted_gate_is_rejected() {
    // Four items of three phases need twelve contexts.
    assert!(Scheduler::new(4, 3, 10).is_err());
    assert!(Scheduler::new(4, 3, 12).is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancelled_item_releases_its_slot() {
    let scheduler = Scheduler::new(1, 3, 3).unwrap();

    let cancelled = tokio::time::timeout(Duration::from_secs(1), async {
        let _slot = scheduler.admit().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    })
    .await;
    assert!(cancelled.is_err());

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.acquired, 1);
    assert_eq!(snapshot.released, 1);
    assert_eq!(snapshot.in_flight, 0);

    // The slot is usable again.
    let slot = tokio::time::timeout(Duration::from_secs(1), scheduler.admit()).await;
    assert!(slot.is_ok());
}
