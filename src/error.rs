//! Error taxonomy shared by the crawler and the retrieval pipeline.

use std::time::Duration;

/// Errors surfaced by archive operations.
///
/// The crawler absorbs most of these per URL (log, skip, mark seen); the
/// retrieval pipeline converts them into a single `error` stream event.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The input could not be parsed as a URL.
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        /// Offending input.
        url: String,
        /// Parser diagnostic.
        #[source]
        source: url::ParseError,
    },

    /// robots.txt denies the target path for this bot.
    #[error("blocked by robots.txt: {path}")]
    BlockedByRobots {
        /// Path that was denied.
        path: String,
    },

    /// Transport failure or non-2xx response while fetching a resource.
    #[error("fetch failed for {url}: {reason}")]
    FetchFailed {
        /// Resource that was being fetched.
        url: String,
        /// Transport or status diagnostic.
        reason: String,
    },

    /// Non-error outcome: the resource is not worth archiving.
    #[error("skipped content: {0}")]
    SkippedContent(String),

    /// The HTML document could not be processed.
    #[error("extractor failed: {0}")]
    ExtractorFailed(String),

    /// The relational store failed a health check or write.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A vector-store call failed.
    #[error("vector store error: {0}")]
    VectorStore(String),

    /// The embedding service failed after retries.
    #[error("embedding failed: {0}")]
    EmbedFailed(String),

    /// Streaming from the language model failed.
    #[error("llm stream error: {0}")]
    LlmStream(String),

    /// The store did not close within the shutdown grace period.
    #[error("store shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Cancellation was observed at a suspension point.
    #[error("shutdown requested")]
    ShutdownRequested,
}

impl From<sqlx::Error> for ArchiveError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl ArchiveError {
    /// True when the outcome is a routine skip rather than a failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::SkippedContent(_) | Self::BlockedByRobots { .. } | Self::ShutdownRequested
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;
