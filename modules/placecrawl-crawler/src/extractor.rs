// Page extraction: serialized DOM → typed phase payload.
//
// The orchestrator hands over a navigated, expanded context; the extractor
// reads it once and never navigates. Selectors come from the site profile and
// are compiled up front so a bad selector fails at startup, not mid-run.

use std::sync::LazyLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use placecrawl_common::file_config::{
    HomeSelectors, InfoSelectors, ListingSelectors, ReviewSelectors, SiteConfig,
};
use placecrawl_common::{
    Candidate, EntityId, HomeFields, InfoFields, PhaseKind, PhasePayload, PhaseResult, Review,
};

use crate::browser::BrowsingContext;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,]*").expect("valid regex"));
static DECIMAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"));
static KOREAN_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})년\s*(\d{1,2})월\s*(\d{1,2})일").expect("valid regex")
});

#[async_trait]
pub trait PageExtractor: Send + Sync {
    /// Read one phase's payload from an already-prepared context.
    async fn extract(
        &self,
        context: &dyn BrowsingContext,
        phase: PhaseKind,
        entity: &EntityId,
    ) -> PhaseResult;
}

// ---------------------------------------------------------------------------
// SelectorExtractor
// ---------------------------------------------------------------------------

pub struct SelectorExtractor {
    home: Option<HomeRules>,
    info: Option<InfoRules>,
    reviews: Option<ReviewRules>,
}

struct HomeRules {
    name: Option<Selector>,
    category: Option<Selector>,
    address: Option<Selector>,
    opening_hours: Option<Selector>,
    rating: Option<Selector>,
    visitor_reviews: Option<Selector>,
    blog_reviews: Option<Selector>,
}

struct InfoRules {
    services: Option<Selector>,
    badges: Option<Selector>,
}

struct ReviewRules {
    item: Selector,
    nickname: Option<Selector>,
    content: Option<Selector>,
    date: Option<Selector>,
    situations: Option<Selector>,
    keywords: Option<Selector>,
    review_count: Option<Selector>,
    visit_count: Option<Selector>,
    min_reviews: usize,
    max_reviews: Option<usize>,
}

impl SelectorExtractor {
    pub fn new(site: &SiteConfig) -> Result<Self> {
        Ok(Self {
            home: site
                .home
                .as_ref()
                .map(|home| HomeRules::compile(&home.fields))
                .transpose()?,
            info: site
                .info
                .as_ref()
                .map(|info| InfoRules::compile(&info.fields))
                .transpose()?,
            reviews: site
                .reviews
                .as_ref()
                .map(|reviews| {
                    ReviewRules::compile(&reviews.fields, reviews.min_reviews, reviews.max_reviews)
                })
                .transpose()?,
        })
    }

    /// Synchronous half of `extract`. `Html` is not `Send`, so parsing stays
    /// out of the async body.
    fn parse(&self, html: &str, phase: PhaseKind) -> PhaseResult {
        let doc = Html::parse_document(html);
        let root = doc.root_element();
        match phase {
            PhaseKind::Home => match &self.home {
                Some(rules) => PhaseResult::Success(PhasePayload::Home(rules.read(root))),
                None => unconfigured(phase),
            },
            PhaseKind::Info => match &self.info {
                Some(rules) => PhaseResult::Success(PhasePayload::Info(rules.read(root))),
                None => unconfigured(phase),
            },
            PhaseKind::Reviews => match &self.reviews {
                Some(rules) => rules.read(root),
                None => unconfigured(phase),
            },
        }
    }
}

fn unconfigured(phase: PhaseKind) -> PhaseResult {
    PhaseResult::Failed(format!("no extraction rules for {phase} phase"))
}

#[async_trait]
impl PageExtractor for SelectorExtractor {
    async fn extract(
        &self,
        context: &dyn BrowsingContext,
        phase: PhaseKind,
        entity: &EntityId,
    ) -> PhaseResult {
        let html = match context.html().await {
            Ok(html) => html,
            Err(e) => return PhaseResult::Failed(format!("failed to read DOM: {e:#}")),
        };
        let result = self.parse(&html, phase);
        debug!(entity = %entity, %phase, bytes = html.len(), "Extracted phase");
        result
    }
}

impl HomeRules {
    fn compile(fields: &HomeSelectors) -> Result<Self> {
        Ok(Self {
            name: compile_opt(&fields.name)?,
            category: compile_opt(&fields.category)?,
            address: compile_opt(&fields.address)?,
            opening_hours: compile_opt(&fields.opening_hours)?,
            rating: compile_opt(&fields.rating)?,
            visitor_reviews: compile_opt(&fields.visitor_reviews)?,
            blog_reviews: compile_opt(&fields.blog_reviews)?,
        })
    }

    fn read(&self, root: ElementRef<'_>) -> HomeFields {
        HomeFields {
            name: first_text(root, &self.name),
            category: first_text(root, &self.category),
            address: first_text(root, &self.address),
            opening_hours: self
                .opening_hours
                .as_ref()
                .map(|sel| all_texts(root, sel).join(" | "))
                .filter(|s| !s.is_empty()),
            rating: first_text(root, &self.rating).and_then(|t| parse_decimal(&t)),
            visitor_review_count: first_text(root, &self.visitor_reviews)
                .and_then(|t| parse_count(&t)),
            blog_review_count: first_text(root, &self.blog_reviews).and_then(|t| parse_count(&t)),
        }
    }
}

impl InfoRules {
    fn compile(fields: &InfoSelectors) -> Result<Self> {
        Ok(Self {
            services: compile_opt(&fields.services)?,
            badges: compile_opt(&fields.badges)?,
        })
    }

    fn read(&self, root: ElementRef<'_>) -> InfoFields {
        InfoFields {
            services: self
                .services
                .as_ref()
                .map(|sel| all_texts(root, sel))
                .unwrap_or_default(),
            badges: self
                .badges
                .as_ref()
                .map(|sel| all_texts(root, sel))
                .unwrap_or_default(),
        }
    }
}

impl ReviewRules {
    fn compile(fields: &ReviewSelectors, min_reviews: usize, max_reviews: Option<usize>) -> Result<Self> {
        Ok(Self {
            item: compile(&fields.item)?,
            nickname: compile_opt(&fields.nickname)?,
            content: compile_opt(&fields.content)?,
            date: compile_opt(&fields.date)?,
            situations: compile_opt(&fields.situations)?,
            keywords: compile_opt(&fields.keywords)?,
            review_count: compile_opt(&fields.review_count)?,
            visit_count: compile_opt(&fields.visit_count)?,
            min_reviews,
            max_reviews,
        })
    }

    fn read(&self, root: ElementRef<'_>) -> PhaseResult {
        let mut reviews: Vec<Review> = root
            .select(&self.item)
            .map(|entry| Review {
                nickname: first_text(entry, &self.nickname),
                content: first_text(entry, &self.content),
                date: first_text(entry, &self.date).map(|raw| normalize_date(&raw)),
                situations: self
                    .situations
                    .as_ref()
                    .map(|sel| all_texts(entry, sel))
                    .unwrap_or_default(),
                keywords: self
                    .keywords
                    .as_ref()
                    .map(|sel| all_texts(entry, sel))
                    .unwrap_or_default(),
                review_count: first_text(entry, &self.review_count).and_then(|t| parse_count(&t)),
                visit_count: first_text(entry, &self.visit_count).and_then(|t| parse_count(&t)),
            })
            .collect();

        if reviews.len() < self.min_reviews {
            return PhaseResult::Insufficient(format!(
                "{} reviews rendered, {} required",
                reviews.len(),
                self.min_reviews
            ));
        }
        if let Some(max) = self.max_reviews {
            reviews.truncate(max);
        }
        PhaseResult::Success(PhasePayload::Reviews(reviews))
    }
}

// ---------------------------------------------------------------------------
// Search listings
// ---------------------------------------------------------------------------

/// Compiled selectors for search-result entries.
pub struct ListingRules {
    item: Selector,
    id_attr: String,
    id_selector: Option<Selector>,
    name: Selector,
    category: Option<Selector>,
    review_count: Option<Selector>,
    rating: Option<Selector>,
}

impl ListingRules {
    pub fn compile(item: &str, fields: &ListingSelectors) -> Result<Self> {
        Ok(Self {
            item: compile(item)?,
            id_attr: fields.id_attr.clone(),
            id_selector: compile_opt(&fields.id_selector)?,
            name: compile(&fields.name)?,
            category: compile_opt(&fields.category)?,
            review_count: compile_opt(&fields.review_count)?,
            rating: compile_opt(&fields.rating)?,
        })
    }

    /// Entries lacking an id or a name are dropped.
    pub fn read(&self, html: &str) -> Vec<Candidate> {
        let doc = Html::parse_document(html);
        doc.select(&self.item)
            .filter_map(|entry| {
                let id_holder = match &self.id_selector {
                    Some(sel) => entry.select(sel).next()?,
                    None => entry,
                };
                let id = id_holder.value().attr(&self.id_attr)?.trim();
                if id.is_empty() {
                    return None;
                }
                let name = text_of(entry.select(&self.name).next()?)?;
                Some(Candidate {
                    entity_id: EntityId::new(id),
                    name,
                    category: first_text(entry, &self.category),
                    review_count: first_text(entry, &self.review_count)
                        .and_then(|t| parse_count(&t)),
                    rating: first_text(entry, &self.rating).and_then(|t| parse_decimal(&t)),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow!("invalid selector {selector:?}: {e}"))
}

fn compile_opt(selector: &Option<String>) -> Result<Option<Selector>> {
    selector.as_deref().map(compile).transpose()
}

/// Whitespace-collapsed text of an element; `None` when blank.
fn text_of(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn first_text(root: ElementRef<'_>, selector: &Option<Selector>) -> Option<String> {
    let selector = selector.as_ref()?;
    root.select(selector).find_map(text_of)
}

fn all_texts(root: ElementRef<'_>, selector: &Selector) -> Vec<String> {
    root.select(selector).filter_map(text_of).collect()
}

/// First integer in the text, thousands separators removed.
/// `"방문자 리뷰 1,234"` → `1234`.
pub fn parse_count(text: &str) -> Option<u32> {
    NUMBER_RE
        .find(text)
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
}

/// First decimal in the text. `"별점 4.52"` → `4.52`.
pub fn parse_decimal(text: &str) -> Option<f32> {
    DECIMAL_RE.find(text).and_then(|m| m.as_str().parse().ok())
}

/// `2024년 5월 3일 금요일` → `2024-05-03`. Text without a recognizable date
/// is returned unchanged.
pub fn normalize_date(raw: &str) -> String {
    match KOREAN_DATE_RE.captures(raw) {
        Some(caps) => {
            let part = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
            format!("{:04}-{:02}-{:02}", part(1), part(2), part(3))
        }
        None => raw.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use placecrawl_common::file_config::ReviewsPhaseConfig;

    use super::*;

    #[test]
    fn counts_and_ratings_tolerate_labels() {
        assert_eq!(parse_count("방문자 리뷰 1,234"), Some(1234));
        assert_eq!(parse_count("리뷰 없음"), None);
        assert_eq!(parse_decimal("별점 4.52 / 5"), Some(4.52));
        assert_eq!(parse_decimal("4"), Some(4.0));
    }

    #[test]
    fn korean_dates_are_normalized() {
        assert_eq!(normalize_date("2024년 5월 3일 금요일"), "2024-05-03");
        assert_eq!(normalize_date(" 24.5.3.금 "), "24.5.3.금");
    }

    fn reviews_site(min_reviews: usize, max_reviews: Option<usize>) -> SiteConfig {
        let reviews: ReviewsPhaseConfig = toml::from_str(&format!(
            r#"
            min_reviews = {min_reviews}
            {}
            [page]
            url = "https://place.example.com/{{id}}/review"
            [fields]
            item = "li.review"
            nickname = ".nick"
            content = ".body"
            date = "time"
            keywords = ".kw"
            visit_count = ".visits"
            "#,
            max_reviews.map(|m| format!("max_reviews = {m}")).unwrap_or_default()
        ))
        .unwrap();
        SiteConfig {
            reviews: Some(reviews),
            ..Default::default()
        }
    }

    const REVIEW_PAGE: &str = r#"
        <ul>
          <li class="review"><span class="nick">kim</span><div class="body">맛있어요
            정말</div><time>2024년 11월 2일 토요일</time>
            <span class="kw">음식이 맛있어요</span><span class="kw">친절해요</span>
            <span class="visits">3번째 방문</span></li>
          <li class="review"><span class="nick">lee</span><div class="body">good</div></li>
          <li class="review"><span class="nick">park</span></li>
        </ul>"#;

    #[test]
    fn reviews_are_read_per_entry() {
        let extractor = SelectorExtractor::new(&reviews_site(1, None)).unwrap();
        let PhaseResult::Success(PhasePayload::Reviews(reviews)) =
            extractor.parse(REVIEW_PAGE, PhaseKind::Reviews)
        else {
            panic!("expected reviews");
        };
        assert_eq!(reviews.len(), 3);
        assert_eq!(reviews[0].nickname.as_deref(), Some("kim"));
        assert_eq!(reviews[0].content.as_deref(), Some("맛있어요 정말"));
        assert_eq!(reviews[0].date.as_deref(), Some("2024-11-02"));
        assert_eq!(reviews[0].keywords, vec!["음식이 맛있어요", "친절해요"]);
        assert_eq!(reviews[0].visit_count, Some(3));
        assert_eq!(reviews[2].content, None);
    }

    #[test]
    fn too_few_reviews_is_insufficient() {
        let extractor = SelectorExtractor::new(&reviews_site(5, None)).unwrap();
        assert!(matches!(
            extractor.parse(REVIEW_PAGE, PhaseKind::Reviews),
            PhaseResult::Insufficient(_)
        ));
    }

    #[test]
    fn reviews_truncated_to_max() {
        let extractor = SelectorExtractor::new(&reviews_site(1, Some(2))).unwrap();
        let PhaseResult::Success(PhasePayload::Reviews(reviews)) =
            extractor.parse(REVIEW_PAGE, PhaseKind::Reviews)
        else {
            panic!("expected reviews");
        };
        assert_eq!(reviews.len(), 2);
    }

    #[test]
    fn unconfigured_phase_fails() {
        let extractor = SelectorExtractor::new(&reviews_site(1, None)).unwrap();
        assert!(matches!(
            extractor.parse(REVIEW_PAGE, PhaseKind::Home),
            PhaseResult::Failed(_)
        ));
    }

    #[test]
    fn listings_skip_entries_without_id() {
        let fields = ListingSelectors {
            id_attr: "data-id".into(),
            id_selector: Some("a.place".into()),
            name: ".name".into(),
            category: Some(".cat".into()),
            review_count: Some(".reviews".into()),
            rating: Some(".rating".into()),
        };
        let rules = ListingRules::compile("li.item", &fields).unwrap();
        let html = r#"
            <li class="item"><a class="place" data-id="101"><span class="name">A식당</span></a>
                <span class="cat">한식</span><span class="reviews">리뷰 999+</span>
                <span class="rating">4.4</span></li>
            <li class="item"><a class="place"><span class="name">no id</span></a></li>
            <li class="item"><a class="place" data-id="103"><span class="name">C카페</span></a></li>
        "#;
        let candidates = rules.read(html);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].entity_id.as_str(), "101");
        assert_eq!(candidates[0].review_count, Some(999));
        assert_eq!(candidates[0].rating, Some(4.4));
        assert_eq!(candidates[1].category, None);
    }

    #[test]
    fn invalid_selector_fails_at_construction() {
        let fields = ListingSelectors {
            id_attr: "data-id".into(),
            id_selector: None,
            name: "[[broken".into(),
            category: None,
            review_count: None,
            rating: None,
        };
        assert!(ListingRules::compile("li", &fields).is_err());
    }
}
