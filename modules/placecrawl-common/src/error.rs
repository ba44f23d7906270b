use thiserror::Error;

use crate::types::TargetId;

/// Result type alias for crawl components.
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Component-level failures. Per-item outcomes are modeled by
/// [`crate::types::FailureKind`] and never surface here.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Candidate lookup failed for target {target}: {message}")]
    Lookup { target: TargetId, message: String },

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
