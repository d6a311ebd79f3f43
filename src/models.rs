//! Data shapes produced by the crawler and persisted to the stores.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A hyperlink discovered on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Visible anchor text (may be empty).
    pub text: String,
    /// Canonicalized target URL.
    pub url: String,
}

impl Link {
    /// Builds a link with empty anchor text, used for seeds and sitemap hits.
    pub fn bare(url: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            url: url.into(),
        }
    }
}

/// An image referenced by a page, downloaded to local storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    /// Absolute source URL.
    pub url: String,
    /// Alt text, possibly empty.
    pub alt: String,
    /// Local filesystem path of the downloaded copy.
    pub local_path: String,
}

/// A PDF document discovered on a page and run through the PDF pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfData {
    /// Original URL of the PDF.
    pub url: String,
    /// Local filesystem path of the downloaded copy.
    pub local_path: String,
    /// Text extracted from the PDF (empty when extraction failed).
    pub text: String,
    /// Size of the downloaded file in bytes.
    pub file_size: u64,
}

/// Everything extracted from a single crawled page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageData {
    /// Page URL (trailing slashes stripped before persistence).
    pub url: String,
    /// Document title, `<title>` first, `og:title` as fallback.
    pub title: String,
    /// Meta description or `og:description`.
    pub meta_description: String,
    /// Meta keywords.
    pub meta_keywords: String,
    /// `<link rel=canonical>` target, if present.
    pub canonical: String,
    /// Declared language (`meta name=language` or `og:locale`).
    pub language: String,
    /// First favicon href resolved to an absolute URL.
    pub favicon: String,
    /// Heading texts keyed by tag (`h1`..`h6`), in document order.
    pub headings: BTreeMap<String, Vec<String>>,
    /// Readable body text accumulated outside chrome elements.
    pub main_content: String,
    /// Alt texts of all images on the page.
    pub image_alt: Vec<String>,
    /// Images downloaded from allowed origins.
    pub images: Vec<ImageData>,
    /// PDFs whose processing completed before the page was persisted.
    pub pdfs: Vec<PdfData>,
    /// Anchor texts of all links on the page.
    pub link_text: Vec<String>,
    /// All canonicalized outbound links.
    pub outbound_links: Vec<Link>,
    /// Whitespace-token count of `main_content`.
    pub word_count: usize,
    /// HTTP status of the fetch.
    pub status_code: u16,
    /// Fetch duration in milliseconds.
    pub response_time_ms: u64,
    /// Response Content-Type header.
    pub content_type: String,
    /// When this crawl happened.
    pub crawl_date: DateTime<Utc>,
    /// Last-Modified response header, when the server sent one.
    pub last_modified: Option<DateTime<Utc>>,
}

impl PageData {
    /// Creates an empty record for a URL about to be extracted.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            meta_description: String::new(),
            meta_keywords: String::new(),
            canonical: String::new(),
            language: String::new(),
            favicon: String::new(),
            headings: BTreeMap::new(),
            main_content: String::new(),
            image_alt: Vec::new(),
            images: Vec::new(),
            pdfs: Vec::new(),
            link_text: Vec::new(),
            outbound_links: Vec::new(),
            word_count: 0,
            status_code: 0,
            response_time_ms: 0,
            content_type: String::new(),
            crawl_date: Utc::now(),
            last_modified: None,
        }
    }

    /// Recomputes `word_count` from the current `main_content`.
    pub fn refresh_word_count(&mut self) {
        self.word_count = self.main_content.split_whitespace().count();
    }

    /// Flattened heading list in `h1..h6` order, used for the vector payload.
    pub fn heading_list(&self) -> Vec<String> {
        self.headings.values().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_count_tracks_main_content() {
        let mut page = PageData::new("https://a.test");
        page.main_content = "  one two\tthree\nfour  ".to_string();
        page.refresh_word_count();
        assert_eq!(page.word_count, 4);
    }

    #[test]
    fn heading_list_preserves_level_order() {
        let mut page = PageData::new("https://a.test");
        page.headings
            .insert("h2".to_string(), vec!["second".to_string()]);
        page.headings
            .insert("h1".to_string(), vec!["first".to_string()]);
        assert_eq!(page.heading_list(), vec!["first", "second"]);
    }
}
