use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Partition key for a batch of work (an administrative-area code).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

/// Opaque id of a place as issued by the remote site.
/// Unique within one target's candidate set, not globally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(TargetId);
string_id!(EntityId);

// ---------------------------------------------------------------------------
// Work units
// ---------------------------------------------------------------------------

/// One area to harvest: its partition id plus the query typed into the
/// remote search box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub search_key: String,
    pub city: Option<String>,
    pub district: Option<String>,
}

impl Target {
    pub fn new(id: impl Into<String>, search_key: impl Into<String>) -> Self {
        Self {
            id: TargetId::new(id),
            search_key: search_key.into(),
            city: None,
            district: None,
        }
    }
}

/// One candidate place within a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub target_id: TargetId,
    pub entity_id: EntityId,
    pub display_name: String,
}

impl WorkItem {
    pub fn new(
        target_id: TargetId,
        entity_id: EntityId,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            target_id,
            entity_id,
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.target_id, self.entity_id, self.display_name)
    }
}

/// A search-result listing, before it becomes a WorkItem.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub entity_id: EntityId,
    pub name: String,
    pub category: Option<String>,
    pub review_count: Option<u32>,
    pub rating: Option<f32>,
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Home,
    Info,
    Reviews,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 3] = [PhaseKind::Home, PhaseKind::Info, PhaseKind::Reviews];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Home => "home",
            PhaseKind::Info => "info",
            PhaseKind::Reviews => "reviews",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile fields read from the place's landing page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomeFields {
    pub name: Option<String>,
    pub category: Option<String>,
    pub address: Option<String>,
    pub opening_hours: Option<String>,
    pub rating: Option<f32>,
    pub visitor_review_count: Option<u32>,
    pub blog_review_count: Option<u32>,
}

/// Amenity lists read from the information page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoFields {
    pub services: Vec<String>,
    pub badges: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub nickname: Option<String>,
    pub content: Option<String>,
    /// `YYYY-MM-DD` when the page date could be parsed, raw text otherwise.
    pub date: Option<String>,
    pub situations: Vec<String>,
    pub keywords: Vec<String>,
    /// Total reviews written by the reviewer.
    pub review_count: Option<u32>,
    /// Times the reviewer visited this place.
    pub visit_count: Option<u32>,
}

/// Payload of one successful phase. One variant per phase kind.
#[derive(Debug, Clone, PartialEq)]
pub enum PhasePayload {
    Home(HomeFields),
    Info(InfoFields),
    Reviews(Vec<Review>),
}

impl PhasePayload {
    pub fn kind(&self) -> PhaseKind {
        match self {
            PhasePayload::Home(_) => PhaseKind::Home,
            PhasePayload::Info(_) => PhaseKind::Info,
            PhasePayload::Reviews(_) => PhaseKind::Reviews,
        }
    }
}

/// Outcome of one phase of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseResult {
    Success(PhasePayload),
    /// Content was read but fell below the quality gate. Not retried.
    Insufficient(String),
    TimedOut,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Merged item records
// ---------------------------------------------------------------------------

/// A fully harvested place: the union of every phase payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRecord {
    pub place_id: EntityId,
    pub target_id: TargetId,
    pub display_name: String,
    pub home: HomeFields,
    pub info: InfoFields,
    pub reviews: Vec<Review>,
    pub crawled_at: DateTime<Utc>,
}

impl PlaceRecord {
    /// Merge phase payloads into one record. Phases that were not run leave
    /// their fields at the default.
    pub fn from_payloads(
        item: &WorkItem,
        payloads: impl IntoIterator<Item = PhasePayload>,
        crawled_at: DateTime<Utc>,
    ) -> Self {
        let mut record = Self {
            place_id: item.entity_id.clone(),
            target_id: item.target_id.clone(),
            display_name: item.display_name.clone(),
            home: HomeFields::default(),
            info: InfoFields::default(),
            reviews: Vec::new(),
            crawled_at,
        };
        for payload in payloads {
            match payload {
                PhasePayload::Home(home) => record.home = home,
                PhasePayload::Info(info) => record.info = info,
                PhasePayload::Reviews(reviews) => record.reviews = reviews,
            }
        }
        record
    }

    /// Name shown on the page, falling back to the search listing name.
    pub fn name(&self) -> &str {
        self.home.name.as_deref().unwrap_or(&self.display_name)
    }
}

/// Why an item did not produce a record.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    Insufficient { phase: PhaseKind, reason: String },
    TimedOut { phase: Option<PhaseKind> },
    Error { phase: Option<PhaseKind>, message: String },
}

impl FailureKind {
    /// Quality-gate misses are skipped; everything else gets another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Insufficient { .. })
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Insufficient { phase, reason } => {
                write!(f, "insufficient content in {phase}: {reason}")
            }
            FailureKind::TimedOut { phase: Some(phase) } => write!(f, "{phase} phase timed out"),
            FailureKind::TimedOut { phase: None } => f.write_str("item timed out"),
            FailureKind::Error {
                phase: Some(phase),
                message,
            } => write!(f, "{phase} phase failed: {message}"),
            FailureKind::Error {
                phase: None,
                message,
            } => write!(f, "item failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub item: WorkItem,
    pub kind: FailureKind,
}

/// Merged outcome of all phases for one WorkItem.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemRecord {
    Complete(PlaceRecord),
    Failed(ItemFailure),
}

/// Row of a target's failure log. Column names match the reprocessing CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    #[serde(rename = "adm_dong_code")]
    pub target_id: TargetId,
    #[serde(rename = "pid")]
    pub entity_id: EntityId,
    #[serde(rename = "pname")]
    pub display_name: String,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(item: &WorkItem, reason: impl Into<String>) -> Self {
        Self {
            target_id: item.target_id.clone(),
            entity_id: item.entity_id.clone(),
            display_name: item.display_name.clone(),
            reason: reason.into(),
        }
    }

    pub fn work_item(&self) -> WorkItem {
        WorkItem::new(
            self.target_id.clone(),
            self.entity_id.clone(),
            self.display_name.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::new("1144066000".into(), "38232807".into(), "소녀방앗간")
    }

    #[test]
    fn merge_takes_union_of_phase_payloads() {
        let home = HomeFields {
            name: Some("소녀방앗간 이화여대점".into()),
            rating: Some(4.6),
            ..Default::default()
        };
        let info = InfoFields {
            services: vec!["주차".into(), "포장".into()],
            badges: vec![],
        };
        let reviews = vec![Review {
            nickname: Some("foodie".into()),
            ..Default::default()
        }];

        let at = Utc::now();
        let record = PlaceRecord::from_payloads(
            &item(),
            vec![
                PhasePayload::Reviews(reviews.clone()),
                PhasePayload::Home(home.clone()),
                PhasePayload::Info(info.clone()),
            ],
            at,
        );

        assert_eq!(record.home, home);
        assert_eq!(record.info, info);
        assert_eq!(record.reviews, reviews);
        assert_eq!(record.place_id.as_str(), "38232807");
        assert_eq!(record.target_id.as_str(), "1144066000");
        assert_eq!(record.name(), "소녀방앗간 이화여대점");
    }

    #[test]
    fn name_falls_back_to_listing_name() {
        let record = PlaceRecord::from_payloads(&item(), vec![], Utc::now());
        assert_eq!(record.name(), "소녀방앗간");
    }

    #[test]
    fn insufficient_is_not_retryable() {
        let kind = FailureKind::Insufficient {
            phase: PhaseKind::Reviews,
            reason: "3 reviews".into(),
        };
        assert!(!kind.is_retryable());
        assert!(FailureKind::TimedOut { phase: None }.is_retryable());
        assert!(FailureKind::Error {
            phase: Some(PhaseKind::Home),
            message: "nav".into()
        }
        .is_retryable());
    }

    #[test]
    fn failure_record_round_trips_to_work_item() {
        let record = FailureRecord::new(&item(), "reviews phase timed out");
        assert_eq!(record.work_item(), item());
    }
}
