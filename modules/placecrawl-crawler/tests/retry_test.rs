//! Bounded retries: at most one failure record per exhausted item, none for
//! items that eventually succeed or fall below the quality gate.

use std::sync::Arc;
use std::time::Duration;

use placecrawl_common::{FailureKind, PhaseKind};
use placecrawl_crawler::testing::{work_item, MemoryStore, Scripted, ScriptedFetcher};
use placecrawl_crawler::{AttemptOutcome, FailureTracker, RetryPolicy};

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        item_timeout: Duration::from_secs(120),
        max_retries,
        pause: Duration::from_secs(2),
    }
}

fn timed_out() -> Scripted {
    Scripted::Fail(FailureKind::TimedOut {
        phase: Some(PhaseKind::Reviews),
    })
}

fn broken() -> Scripted {
    Scripted::Fail(FailureKind::Error {
        phase: Some(PhaseKind::Home),
        message: "navigation failed".into(),
    })
}

#[tokio::test(start_paused = true)]
async fn success_on_last_attempt_leaves_no_record() {
    let log = Arc::new(MemoryStore::new());
    let tracker = FailureTracker::new(policy(3), log.clone());
    let fetcher = ScriptedFetcher::new().script("1", vec![timed_out(), broken(), Scripted::Complete]);

    let outcome = tracker.attempt(&work_item("A", "1"), &fetcher).await;

    assert!(matches!(outcome, AttemptOutcome::Success(_)));
    assert_eq!(fetcher.calls("1"), 3);
    assert!(log.failures("A").is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_item_is_recorded_exactly_once() {
    let log = Arc::new(MemoryStore::new());
    let tracker = FailureTracker::new(policy(3), log.clone());
    let fetcher =
        ScriptedFetcher::new().script("1", vec![broken(), broken(), timed_out(), broken()]);

    let outcome = tracker.attempt(&work_item("A", "1"), &fetcher).await;

    let AttemptOutcome::Exhausted(record) = outcome else {
        panic!("expected exhaustion");
    };
    assert_eq!(fetcher.calls("1"), 3);
    assert_eq!(record.reason, "reviews phase timed out");

    let failures = log.failures("A");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0], record);
}

#[tokio::test(start_paused = true)]
async fn pause_separates_attempts() {
    let log = Arc::new(MemoryStore::new());
    let tracker = FailureTracker::new(policy(3), log);
    let fetcher = ScriptedFetcher::new().script("1", vec![broken(), broken(), broken()]);

    let started = tokio::time::Instant::now();
    tracker.attempt(&work_item("A", "1"), &fetcher).await;

    // Two pauses between three attempts, none after the last.
    assert_eq!(started.elapsed(), Duration::from_secs(4));
}

#[tokio::test]
async fn insufficient_content_is_not_retried() {
    let log = Arc::new(MemoryStore::new());
    let tracker = FailureTracker::new(policy(3), log.clone());
    let fetcher = ScriptedFetcher::new().script(
        "1",
        vec![Scripted::Fail(FailureKind::Insufficient {
            phase: PhaseKind::Reviews,
            reason: "2 reviews, need 5".into(),
        })],
    );

    let outcome = tracker.attempt(&work_item("A", "1"), &fetcher).await;

    assert!(matches!(
        outcome,
        AttemptOutcome::Skipped(FailureKind::Insufficient { .. })
    ));
    assert_eq!(fetcher.calls("1"), 1);
    assert!(log.failures("A").is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_attempt_counts_as_timeout() {
    let log = Arc::new(MemoryStore::new());
    let tracker = FailureTracker::new(policy(2), log.clone());
    let fetcher = ScriptedFetcher::new().script("1", vec![Scripted::Hang(Duration::from_secs(600))]);

    let outcome = tracker.attempt(&work_item("A", "1"), &fetcher).await;

    assert!(matches!(outcome, AttemptOutcome::Success(_)));
    assert_eq!(fetcher.calls("1"), 2);
    assert!(log.failures("A").is_empty());
}

#[tokio::test(start_paused = true)]
async fn every_attempt_hanging_records_item_timeout() {
    let log = Arc::new(MemoryStore::new());
    let tracker = FailureTracker::new(policy(2), log.clone());
    let hang = || Scripted::Hang(Duration::from_secs(600));
    let fetcher = ScriptedFetcher::new().script("1", vec![hang(), hang()]);

    let outcome = tracker.attempt(&work_item("A", "1"), &fetcher).await;

    assert!(matches!(outcome, AttemptOutcome::Exhausted(_)));
    let failures = log.failures("A");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, "item timed out");
}
