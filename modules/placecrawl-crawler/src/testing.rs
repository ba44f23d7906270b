// Test mocks for the crawl pipeline.
//
// One mock per seam:
// - MockBrowser (ContextFactory) + MockContext (BrowsingContext): URL → HTML,
//   counts opened/closed tabs and peak concurrency
// - MockExtractor (PageExtractor): phase → scripted PhaseResult, optional delay
// - ScriptedFetcher (ItemFetcher): entity → queue of ItemRecords
// - MockCandidateSource (CandidateSource): target → candidates or error
// - MemoryStore (RecordSink + FailureLog): in-memory output and failure logs
//
// Plus helpers for work items, candidates and a three-phase site profile.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use placecrawl_common::file_config::{
    HomePhaseConfig, InfoPhaseConfig, PageSpec, ResourceKind, ReviewSelectors, ReviewsPhaseConfig,
    SiteConfig,
};
use placecrawl_common::{
    Candidate, EntityId, FailureKind, FailureRecord, HomeFields, InfoFields, ItemFailure,
    ItemRecord, PhaseKind, PhasePayload, PhaseResult, PlaceRecord, Review, Target, TargetId,
    WorkItem,
};
use placecrawl_store::{FailureLog, RecordKind, RecordSink, WriteSummary};

use crate::browser::{BrowsingContext, ContextFactory};
use crate::extractor::PageExtractor;
use crate::orchestrator::ItemFetcher;
use crate::planner::{Acceptance, CandidateSource};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn work_item(target: &str, entity: &str) -> WorkItem {
    WorkItem::new(TargetId::new(target), EntityId::new(entity), format!("place {entity}"))
}

pub fn candidate(entity: &str) -> Candidate {
    Candidate {
        entity_id: EntityId::new(entity),
        name: format!("place {entity}"),
        category: Some("일반음식점".into()),
        review_count: Some(120),
        rating: Some(4.5),
    }
}

pub fn place_record(item: &WorkItem) -> PlaceRecord {
    PlaceRecord::from_payloads(item, default_payloads(), Utc::now())
}

fn default_payloads() -> Vec<PhasePayload> {
    vec![
        PhasePayload::Home(HomeFields {
            name: Some("mock place".into()),
            rating: Some(4.5),
            ..Default::default()
        }),
        PhasePayload::Info(InfoFields {
            services: vec!["주차".into()],
            badges: vec![],
        }),
        PhasePayload::Reviews(vec![Review {
            nickname: Some("mock".into()),
            content: Some("good".into()),
            ..Default::default()
        }]),
    ]
}

fn default_result(kind: PhaseKind) -> PhaseResult {
    let payload = default_payloads()
        .into_iter()
        .find(|p| p.kind() == kind)
        .unwrap_or(PhasePayload::Reviews(vec![]));
    PhaseResult::Success(payload)
}

/// Home, info and reviews on `https://place.test/{id}/<phase>`, no ready
/// selectors and no lists.
pub fn site_config() -> SiteConfig {
    let page = |phase: &str| PageSpec {
        url: format!("https://place.test/{{id}}/{phase}"),
        ready: None,
        expand: vec![],
        list: None,
    };
    SiteConfig {
        home: Some(HomePhaseConfig {
            page: page("home"),
            fields: Default::default(),
        }),
        info: Some(InfoPhaseConfig {
            page: page("information"),
            fields: Default::default(),
        }),
        reviews: Some(ReviewsPhaseConfig {
            page: page("review"),
            fields: ReviewSelectors {
                item: "li.review".into(),
                nickname: None,
                content: None,
                date: None,
                situations: None,
                keywords: None,
                review_count: None,
                visit_count: None,
            },
            min_reviews: 1,
            max_reviews: None,
        }),
    }
}

// ---------------------------------------------------------------------------
// MockBrowser / MockContext
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct BrowserStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub open_now: AtomicUsize,
    pub peak_open: AtomicUsize,
    pub blocked: AtomicUsize,
    pub navigations: Mutex<Vec<String>>,
}

impl BrowserStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }
}

/// Serves fixed HTML per URL. Unregistered URLs render an empty body.
pub struct MockBrowser {
    pages: Arc<HashMap<String, String>>,
    stats: Arc<BrowserStats>,
    fail_open: bool,
    close_delay: Duration,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self {
            pages: Arc::new(HashMap::new()),
            stats: Arc::new(BrowserStats::default()),
            fail_open: false,
            close_delay: Duration::ZERO,
        }
    }

    /// Every `close` takes this long before the tab counts as closed.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn on_page(mut self, url: &str, html: &str) -> Self {
        Arc::make_mut(&mut self.pages).insert(url.to_string(), html.to_string());
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::new()
        }
    }

    pub fn stats(&self) -> Arc<BrowserStats> {
        self.stats.clone()
    }
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextFactory for MockBrowser {
    async fn open(&self) -> Result<Box<dyn BrowsingContext>> {
        if self.fail_open {
            bail!("MockBrowser: open refused");
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            pages: self.pages.clone(),
            stats: self.stats.clone(),
            current: Mutex::new(None),
            closed: Mutex::new(false),
            close_delay: self.close_delay,
        }))
    }
}

pub struct MockContext {
    pages: Arc<HashMap<String, String>>,
    stats: Arc<BrowserStats>,
    current: Mutex<Option<String>>,
    closed: Mutex<bool>,
    close_delay: Duration,
}

impl MockContext {
    fn body(&self) -> String {
        let current = self.current.lock().unwrap();
        current
            .as_ref()
            .and_then(|url| self.pages.get(url))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrowsingContext for MockContext {
    async fn block_resources(&self, _kinds: &[ResourceKind]) -> Result<()> {
        self.stats.blocked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.stats.navigations.lock().unwrap().push(url.to_string());
        *self.current.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    async fn wait_for(&self, selector: &str, _timeout: Duration) -> Result<bool> {
        Ok(self.body().contains(selector.trim_start_matches(['.', '#'])))
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        Ok(self.body().matches(selector.trim_start_matches(['.', '#'])).count())
    }

    async fn scroll_to_end(&self, _container: Option<&str>) -> Result<u64> {
        Ok(self.body().len() as u64)
    }

    async fn click(&self, _selector: &str) -> Result<bool> {
        Ok(false)
    }

    async fn html(&self) -> Result<String> {
        Ok(self.body())
    }

    async fn close(&self) -> Result<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        let mut closed = self.closed.lock().unwrap();
        if !*closed {
            *closed = true;
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
            self.stats.open_now.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Phase → scripted result. Unscripted phases succeed with a default payload.
/// A delay is slept before answering, so a phase can be pushed past its
/// timeout under a paused clock.
#[derive(Default)]
pub struct MockExtractor {
    results: HashMap<PhaseKind, PhaseResult>,
    delays: HashMap<PhaseKind, Duration>,
    calls: AtomicUsize,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_phase(mut self, kind: PhaseKind, result: PhaseResult) -> Self {
        self.results.insert(kind, result);
        self
    }

    pub fn delay_phase(mut self, kind: PhaseKind, delay: Duration) -> Self {
        self.delays.insert(kind, delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageExtractor for MockExtractor {
    async fn extract(
        &self,
        _context: &dyn BrowsingContext,
        phase: PhaseKind,
        _entity: &EntityId,
    ) -> PhaseResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&phase) {
            tokio::time::sleep(*delay).await;
        }
        self.results
            .get(&phase)
            .cloned()
            .unwrap_or_else(|| default_result(phase))
    }
}

// ---------------------------------------------------------------------------
// ScriptedFetcher
// ---------------------------------------------------------------------------

/// Entity → queue of outcomes, consumed one per fetch. An empty or missing
/// queue yields a complete record. Tracks calls and concurrency.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<EntityId, VecDeque<Scripted>>>,
    delay: Duration,
    calls: Mutex<HashMap<EntityId, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Clone)]
pub enum Scripted {
    Complete,
    Fail(FailureKind),
    /// Sleep this long before answering (to trip the item timeout).
    Hang(Duration),
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, entity: &str, outcomes: Vec<Scripted>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(EntityId::new(entity), outcomes.into());
        self
    }

    pub fn calls(&self, entity: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&EntityId::new(entity))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemFetcher for ScriptedFetcher {
    async fn fetch(&self, item: &WorkItem) -> ItemRecord {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(item.entity_id.clone())
            .or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&item.entity_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Scripted::Complete);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let record = match next {
            Scripted::Complete => ItemRecord::Complete(place_record(item)),
            Scripted::Fail(kind) => ItemRecord::Failed(ItemFailure {
                item: item.clone(),
                kind,
            }),
            Scripted::Hang(duration) => {
                tokio::time::sleep(duration).await;
                ItemRecord::Complete(place_record(item))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        record
    }
}

// ---------------------------------------------------------------------------
// MockCandidateSource
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockCandidateSource {
    results: HashMap<TargetId, std::result::Result<Vec<Candidate>, String>>,
}

impl MockCandidateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_target(mut self, target: &str, candidates: Vec<Candidate>) -> Self {
        self.results.insert(TargetId::new(target), Ok(candidates));
        self
    }

    pub fn failing_target(mut self, target: &str, message: &str) -> Self {
        self.results
            .insert(TargetId::new(target), Err(message.to_string()));
        self
    }
}

#[async_trait]
impl CandidateSource for MockCandidateSource {
    async fn search(
        &self,
        target: &Target,
        max_count: usize,
        acceptance: &Acceptance,
    ) -> Result<Vec<Candidate>> {
        match self.results.get(&target.id) {
            Some(Ok(candidates)) => Ok(candidates
                .iter()
                .filter(|c| acceptance.accepts(c))
                .take(max_count)
                .cloned()
                .collect()),
            Some(Err(message)) => bail!("{message}"),
            None => Ok(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory sink and failure log with the same idempotency as the CSV store.
#[derive(Default)]
pub struct MemoryStore {
    places: Mutex<HashMap<TargetId, Vec<PlaceRecord>>>,
    failures: Mutex<HashMap<TargetId, Vec<FailureRecord>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a persisted place row.
    pub fn with_place(self, target: &str, entity: &str) -> Self {
        let record = place_record(&work_item(target, entity));
        self.places
            .lock()
            .unwrap()
            .entry(record.target_id.clone())
            .or_default()
            .push(record);
        self
    }

    pub fn with_failure(self, target: &str, entity: &str, reason: &str) -> Self {
        let record = FailureRecord::new(&work_item(target, entity), reason);
        self.failures
            .lock()
            .unwrap()
            .entry(record.target_id.clone())
            .or_default()
            .push(record);
        self
    }

    pub fn places(&self, target: &str) -> Vec<PlaceRecord> {
        self.places
            .lock()
            .unwrap()
            .get(&TargetId::new(target))
            .cloned()
            .unwrap_or_default()
    }

    pub fn failures(&self, target: &str) -> Vec<FailureRecord> {
        self.failures
            .lock()
            .unwrap()
            .get(&TargetId::new(target))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `write` calls, including no-op ones.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for MemoryStore {
    async fn write(
        &self,
        target: &TargetId,
        records: &[PlaceRecord],
    ) -> placecrawl_store::Result<WriteSummary> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut places = self.places.lock().unwrap();
        let rows = places.entry(target.clone()).or_default();
        let mut summary = WriteSummary::default();
        for record in records {
            if rows.iter().any(|r| r.place_id == record.place_id) {
                summary.duplicates += 1;
                continue;
            }
            summary.places += 1;
            summary.reviews += record.reviews.len();
            rows.push(record.clone());
        }
        Ok(summary)
    }

    async fn exists(&self, target: &TargetId, entity: &EntityId) -> placecrawl_store::Result<bool> {
        Ok(self
            .places
            .lock()
            .unwrap()
            .get(target)
            .is_some_and(|rows| rows.iter().any(|r| &r.place_id == entity)))
    }

    async fn persisted_entities(
        &self,
        target: &TargetId,
    ) -> placecrawl_store::Result<HashSet<EntityId>> {
        Ok(self
            .places
            .lock()
            .unwrap()
            .get(target)
            .map(|rows| rows.iter().map(|r| r.place_id.clone()).collect())
            .unwrap_or_default())
    }

    async fn has_artifact(&self, target: &TargetId, kind: RecordKind) -> placecrawl_store::Result<bool> {
        let present = match kind {
            RecordKind::PlaceInfo => !self.places(target.as_str()).is_empty(),
            RecordKind::Reviews => self
                .places(target.as_str())
                .iter()
                .any(|r| !r.reviews.is_empty()),
            RecordKind::Failures => !self.failures(target.as_str()).is_empty(),
        };
        Ok(present)
    }
}

#[async_trait]
impl FailureLog for MemoryStore {
    async fn load(&self, target: &TargetId) -> placecrawl_store::Result<Vec<FailureRecord>> {
        Ok(self.failures(target.as_str()))
    }

    async fn record(&self, failure: FailureRecord) -> placecrawl_store::Result<()> {
        let mut failures = self.failures.lock().unwrap();
        let rows = failures.entry(failure.target_id.clone()).or_default();
        rows.retain(|row| row.entity_id != failure.entity_id);
        rows.push(failure);
        Ok(())
    }

    async fn resolve(&self, target: &TargetId, entity: &EntityId) -> placecrawl_store::Result<bool> {
        let mut failures = self.failures.lock().unwrap();
        let Some(rows) = failures.get_mut(target) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|row| &row.entity_id != entity);
        Ok(rows.len() != before)
    }

    async fn targets(&self) -> placecrawl_store::Result<Vec<TargetId>> {
        let mut targets: Vec<TargetId> = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(target, _)| target.clone())
            .collect();
        targets.sort();
        Ok(targets)
    }
}
