// Flat CSV row shapes. Column order is the artifact schema.

use serde::{Deserialize, Serialize};

use placecrawl_common::{PlaceRecord, Review};

const LIST_SEPARATOR: &str = ", ";

#[derive(Debug, Serialize)]
pub(crate) struct PlaceRow<'a> {
    pub place_id: &'a str,
    pub adm_dong_code: &'a str,
    pub name: &'a str,
    pub category: Option<&'a str>,
    pub address: Option<&'a str>,
    pub opening_hours: Option<&'a str>,
    pub services: String,
    pub naver_rating: Option<f32>,
    pub visitor_review_count: Option<u32>,
    pub blog_review_count: Option<u32>,
    pub badges: String,
    pub crawled_at: String,
}

impl<'a> PlaceRow<'a> {
    pub fn from_record(record: &'a PlaceRecord) -> Self {
        Self {
            place_id: record.place_id.as_str(),
            adm_dong_code: record.target_id.as_str(),
            name: record.name(),
            category: record.home.category.as_deref(),
            address: record.home.address.as_deref(),
            opening_hours: record.home.opening_hours.as_deref(),
            services: record.info.services.join(LIST_SEPARATOR),
            naver_rating: record.home.rating,
            visitor_review_count: record.home.visitor_review_count,
            blog_review_count: record.home.blog_review_count,
            badges: record.info.badges.join(LIST_SEPARATOR),
            crawled_at: record.crawled_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ReviewRow<'a> {
    pub place_id: &'a str,
    pub nickname: Option<&'a str>,
    pub content: Option<&'a str>,
    pub date: Option<&'a str>,
    pub situations: String,
    pub keywords: String,
    pub review_count: Option<u32>,
    pub visit_count: Option<u32>,
}

impl<'a> ReviewRow<'a> {
    pub fn from_review(place_id: &'a str, review: &'a Review) -> Self {
        Self {
            place_id,
            nickname: review.nickname.as_deref(),
            content: review.content.as_deref(),
            date: review.date.as_deref(),
            situations: review.situations.join(LIST_SEPARATOR),
            keywords: review.keywords.join(LIST_SEPARATOR),
            review_count: review.review_count,
            visit_count: review.visit_count,
        }
    }
}

/// Only the key column is needed to rebuild a partition index.
#[derive(Debug, Deserialize)]
pub(crate) struct PlaceKey {
    pub place_id: String,
}
