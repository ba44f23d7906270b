use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::CrawlError;
use crate::types::{EntityId, PhaseKind};

/// TOML-backed crawl configuration: concurrency knobs, loader pacing,
/// acceptance policy and the site profile (URL templates + selectors).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub acceptance: AcceptanceConfig,
    pub search: SearchConfig,
    pub site: SiteConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlConfig {
    /// Items allowed in flight at once.
    pub item_capacity: usize,
    /// Browsing contexts allowed open at once, across all items.
    pub context_limit: usize,
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// How long a phase waits for its content-ready selector.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
    /// Total attempts per item, first try included.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,
    /// Places wanted per target.
    #[serde(default = "default_yield_target")]
    pub yield_target: usize,
    /// Candidates requested per wanted place, to absorb drop-out.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_blocked_resources")]
    pub block_resources: Vec<ResourceKind>,
}

impl CrawlConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn candidate_limit(&self) -> usize {
        self.yield_target.saturating_mul(self.candidate_multiplier.max(1))
    }

    /// Shrink the context limit to a remote ceiling, lowering item capacity
    /// so every admitted item can still open all of its phases.
    /// Returns whether anything changed.
    pub fn cap_contexts(&mut self, ceiling: usize, phases_per_item: usize) -> bool {
        if ceiling >= self.context_limit {
            return false;
        }
        self.context_limit = ceiling;
        let fit = ceiling / phases_per_item.max(1);
        if self.item_capacity > fit {
            self.item_capacity = fit.max(1);
        }
        true
    }
}

/// Request categories aborted before navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Image,
    Stylesheet,
    Font,
    Media,
}

impl ResourceKind {
    /// URL patterns matching this kind, for blocklist-based interception.
    pub fn url_patterns(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Image => &["*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico"],
            ResourceKind::Stylesheet => &["*.css"],
            ResourceKind::Font => &["*.woff", "*.woff2", "*.ttf", "*.otf", "*.eot"],
            ResourceKind::Media => &["*.mp4", "*.webm", "*.mp3", "*.m3u8"],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_scroll_pause_ms")]
    pub scroll_pause_ms: u64,
    /// Upper bound of the random extra added to every pause.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_repoll_pause_ms")]
    pub repoll_pause_ms: u64,
    #[serde(default = "default_repolls")]
    pub repolls: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            scroll_pause_ms: default_scroll_pause_ms(),
            jitter_ms: default_jitter_ms(),
            repoll_pause_ms: default_repoll_pause_ms(),
            repolls: default_repolls(),
        }
    }
}

/// Search-listing gate. Empty `categories` accepts every category.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcceptanceConfig {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub min_review_count: u32,
    #[serde(default)]
    pub min_rating: f32,
}

/// A lazily-loaded list on a page.
#[derive(Debug, Clone, Deserialize)]
pub struct ListSpec {
    /// Selector matching one rendered list entry.
    pub item: String,
    pub load_more: Option<String>,
    /// Scrollable element; the document when absent.
    pub container: Option<String>,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Stop once this many entries are rendered. Unbounded when absent.
    pub target_count: Option<usize>,
}

/// How to bring one phase's page to a readable state.
#[derive(Debug, Clone, Deserialize)]
pub struct PageSpec {
    /// URL template; `{id}` is replaced with the entity id.
    pub url: String,
    /// Selector whose presence means the page rendered.
    pub ready: Option<String>,
    /// Controls clicked once before reading (collapsed sections). Best effort.
    #[serde(default)]
    pub expand: Vec<String>,
    pub list: Option<ListSpec>,
}

impl PageSpec {
    pub fn url_for(&self, id: &EntityId) -> String {
        self.url.replace("{id}", id.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// URL template; `{query}` is replaced with the url-encoded search key.
    pub url: String,
    pub ready: Option<String>,
    pub list: ListSpec,
    pub fields: ListingSelectors,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingSelectors {
    /// Attribute carrying the entity id.
    pub id_attr: String,
    /// Element inside the entry holding `id_attr`; the entry itself when absent.
    pub id_selector: Option<String>,
    pub name: String,
    pub category: Option<String>,
    pub review_count: Option<String>,
    pub rating: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteConfig {
    pub home: Option<HomePhaseConfig>,
    pub info: Option<InfoPhaseConfig>,
    pub reviews: Option<ReviewsPhaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomePhaseConfig {
    pub page: PageSpec,
    #[serde(default)]
    pub fields: HomeSelectors,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HomeSelectors {
    pub name: Option<String>,
    pub category: Option<String>,
    pub address: Option<String>,
    pub opening_hours: Option<String>,
    pub rating: Option<String>,
    pub visitor_reviews: Option<String>,
    pub blog_reviews: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfoPhaseConfig {
    pub page: PageSpec,
    #[serde(default)]
    pub fields: InfoSelectors,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfoSelectors {
    pub services: Option<String>,
    pub badges: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewsPhaseConfig {
    pub page: PageSpec,
    pub fields: ReviewSelectors,
    /// Fewer reviews than this marks the place as insufficient.
    #[serde(default = "default_min_reviews")]
    pub min_reviews: usize,
    /// Reviews kept per place.
    pub max_reviews: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewSelectors {
    /// Selector for one review entry; the other selectors are relative to it.
    pub item: String,
    pub nickname: Option<String>,
    pub content: Option<String>,
    pub date: Option<String>,
    pub situations: Option<String>,
    pub keywords: Option<String>,
    pub review_count: Option<String>,
    pub visit_count: Option<String>,
}

impl SiteConfig {
    /// Phases configured for this site, in fixed order.
    pub fn phases(&self) -> Vec<PhaseKind> {
        PhaseKind::ALL
            .into_iter()
            .filter(|kind| self.page(*kind).is_some())
            .collect()
    }

    pub fn page(&self, kind: PhaseKind) -> Option<&PageSpec> {
        match kind {
            PhaseKind::Home => self.home.as_ref().map(|p| &p.page),
            PhaseKind::Info => self.info.as_ref().map(|p| &p.page),
            PhaseKind::Reviews => self.reviews.as_ref().map(|p| &p.page),
        }
    }
}

impl FileConfig {
    /// Reject configurations the scheduler cannot honor.
    pub fn validate(&self) -> crate::Result<()> {
        let phases = self.site.phases();
        if phases.is_empty() {
            return Err(CrawlError::Config("no [site.*] phases configured".into()));
        }
        if self.crawl.item_capacity == 0 {
            return Err(CrawlError::Config("crawl.item_capacity must be at least 1".into()));
        }
        if self.crawl.max_retries == 0 {
            return Err(CrawlError::Config("crawl.max_retries must be at least 1".into()));
        }
        let needed = self.crawl.item_capacity * phases.len();
        if needed > self.crawl.context_limit {
            return Err(CrawlError::Config(format!(
                "item_capacity {} x {} phases = {needed} contexts exceeds context_limit {}",
                self.crawl.item_capacity,
                phases.len(),
                self.crawl.context_limit
            )));
        }
        for kind in phases {
            let Some(page) = self.site.page(kind) else { continue };
            if !page.url.contains("{id}") {
                return Err(CrawlError::Config(format!(
                    "site.{kind}.page.url must contain {{id}}"
                )));
            }
            if page.list.as_ref().is_some_and(|l| l.max_rounds == 0) {
                return Err(CrawlError::Config(format!(
                    "site.{kind}.page.list.max_rounds must be at least 1"
                )));
            }
        }
        if !self.search.url.contains("{query}") {
            return Err(CrawlError::Config("search.url must contain {query}".into()));
        }
        Ok(())
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> anyhow::Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

fn default_phase_timeout_secs() -> u64 {
    60
}
fn default_ready_timeout_secs() -> u64 {
    20
}
fn default_item_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_pause_ms() -> u64 {
    2_000
}
fn default_yield_target() -> usize {
    200
}
fn default_candidate_multiplier() -> usize {
    2
}
fn default_blocked_resources() -> Vec<ResourceKind> {
    vec![ResourceKind::Image, ResourceKind::Stylesheet, ResourceKind::Font]
}
fn default_scroll_pause_ms() -> u64 {
    500
}
fn default_jitter_ms() -> u64 {
    300
}
fn default_repoll_pause_ms() -> u64 {
    1_000
}
fn default_repolls() -> u32 {
    2
}
fn default_max_rounds() -> u32 {
    20
}
fn default_min_reviews() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [crawl]
        item_capacity = 4
        context_limit = 12

        [search]
        url = "https://m.map.example.com/search?query={query}"
        [search.list]
        item = "li.item"
        target_count = 400
        [search.fields]
        id_attr = "data-id"
        name = "strong.name"

        [site.home.page]
        url = "https://m.place.example.com/{id}/home"
        ready = "span.name"
        [site.home.fields]
        name = "span.name"

        [site.info.page]
        url = "https://m.place.example.com/{id}/information"

        [site.reviews.page]
        url = "https://m.place.example.com/{id}/review/visitor"
        [site.reviews.page.list]
        item = "li.review"
        load_more = "a.more"
        max_rounds = 3
        target_count = 20
        [site.reviews.fields]
        item = "li.review"
        content = "div.body"
    "#;

    #[test]
    fn sample_parses_with_defaults() {
        let config: FileConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.crawl.max_retries, 3);
        assert_eq!(config.crawl.item_timeout(), Duration::from_secs(120));
        assert_eq!(config.crawl.candidate_limit(), 400);
        assert_eq!(config.loader.repolls, 2);
        assert_eq!(
            config.site.phases(),
            vec![PhaseKind::Home, PhaseKind::Info, PhaseKind::Reviews]
        );
        assert_eq!(config.site.reviews.as_ref().unwrap().min_reviews, 1);
        config.validate().unwrap();
    }

    #[test]
    fn overcommitted_contexts_are_rejected() {
        let mut config: FileConfig = toml::from_str(SAMPLE).unwrap();
        config.crawl.item_capacity = 5;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CrawlError::Config(msg) if msg.contains("exceeds context_limit")));
    }

    #[test]
    fn remote_ceiling_lowers_capacity_to_fit() {
        let mut config: FileConfig = toml::from_str(SAMPLE).unwrap();
        assert!(config.crawl.cap_contexts(7, 3));
        assert_eq!(config.crawl.context_limit, 7);
        assert_eq!(config.crawl.item_capacity, 2);
        config.validate().unwrap();

        assert!(!config.crawl.cap_contexts(50, 3));
        assert_eq!(config.crawl.context_limit, 7);
    }

    #[test]
    fn unknown_top_level_section_is_rejected() {
        let text = format!("{SAMPLE}\n[server]\nport = 1\n");
        assert!(toml::from_str::<FileConfig>(&text).is_err());
    }

    #[test]
    fn url_template_substitutes_entity() {
        let config: FileConfig = toml::from_str(SAMPLE).unwrap();
        let page = config.site.page(PhaseKind::Home).unwrap();
        assert_eq!(
            page.url_for(&EntityId::new("38232807")),
            "https://m.place.example.com/38232807/home"
        );
    }
}
