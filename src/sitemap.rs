//! Sitemap discovery: probe the conventional locations, parse URL sets
//! and sitemap indexes, and feed hits into the crawl queue.

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, info, warn};

use crate::crawler::queue::CrawlQueue;
use crate::models::Link;

/// Paths probed under the base origin, in order.
const SITEMAP_CANDIDATES: &[&str] = &["/sitemap.xml", "/sitemap_index.xml", "/sitemaps.xml"];

/// Nested index fetches are bounded so a cyclic index cannot loop forever.
const MAX_INDEX_DEPTH: usize = 4;

/// Parsed shape of a sitemap document.
#[derive(Debug, PartialEq, Eq)]
pub enum SitemapDoc {
    /// `<urlset>` of page locations.
    UrlSet(Vec<String>),
    /// `<sitemapindex>` of nested sitemap locations.
    Index(Vec<String>),
    /// Anything that is not a recognizable sitemap.
    Unrecognized,
}

/// Parses sitemap XML into either a URL set or an index of nested sitemaps.
pub fn parse_sitemap(xml: &str) -> SitemapDoc {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<Vec<u8>> = None;
    let mut in_loc = false;
    let mut locs: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                if root.is_none() {
                    root = Some(name.clone());
                }
                in_loc = name == b"loc";
            }
            Ok(Event::Text(t)) if in_loc => {
                if let Ok(text) = t.unescape() {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        locs.push(text);
                    }
                }
            }
            Ok(Event::End(_)) => in_loc = false,
            Ok(Event::Eof) => break,
            Err(_) => return SitemapDoc::Unrecognized,
            _ => {}
        }
    }

    match root.as_deref() {
        Some(name) if name == b"urlset" && !locs.is_empty() => SitemapDoc::UrlSet(locs),
        Some(name) if name == b"sitemapindex" && !locs.is_empty() => SitemapDoc::Index(locs),
        _ => SitemapDoc::Unrecognized,
    }
}

/// Probes the conventional sitemap locations for a base origin and
/// enqueues every allowed URL found. When no sitemap yields anything,
/// the base origin itself is enqueued so the crawl can still start.
///
/// Returns the number of links added to the queue.
pub async fn discover(client: &reqwest::Client, base_url: &str, queue: &CrawlQueue) -> usize {
    let mut added = 0;
    for candidate in SITEMAP_CANDIDATES {
        let sitemap_url = format!("{base_url}{candidate}");
        if walk_sitemap(client, &sitemap_url, queue, &mut added, 0).await {
            break;
        }
    }

    if added == 0 {
        info!(base_url, "no sitemap URLs found, enqueueing base origin");
        queue.enqueue(Link::bare(base_url));
    } else {
        info!(base_url, added, "sitemap discovery finished");
    }
    added
}

/// Fetches one sitemap URL and processes it. Returns true when the
/// document parsed as a sitemap (even if every URL was filtered out).
async fn walk_sitemap(
    client: &reqwest::Client,
    sitemap_url: &str,
    queue: &CrawlQueue,
    added: &mut usize,
    depth: usize,
) -> bool {
    if depth > MAX_INDEX_DEPTH {
        warn!(sitemap_url, "sitemap index nesting too deep, stopping");
        return false;
    }

    debug!(sitemap_url, "fetching sitemap");
    let response = match client.get(sitemap_url).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            debug!(sitemap_url, status = %resp.status(), "sitemap not available");
            return false;
        }
        Err(err) => {
            debug!(sitemap_url, error = %err, "sitemap fetch failed");
            return false;
        }
    };
    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => {
            debug!(sitemap_url, error = %err, "sitemap body read failed");
            return false;
        }
    };

    match parse_sitemap(&body) {
        SitemapDoc::UrlSet(urls) => {
            debug!(sitemap_url, count = urls.len(), "sitemap url set parsed");
            for url in urls {
                if queue.enqueue(Link::bare(url)) {
                    *added += 1;
                }
            }
            true
        }
        SitemapDoc::Index(nested) => {
            debug!(sitemap_url, count = nested.len(), "sitemap index parsed");
            for nested_url in nested {
                Box::pin(walk_sitemap(client, &nested_url, queue, added, depth + 1)).await;
            }
            true
        }
        SitemapDoc::Unrecognized => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_url_set() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://a.test/one</loc><lastmod>2024-01-01</lastmod></url>
              <url><loc>https://a.test/two</loc></url>
            </urlset>"#;
        assert_eq!(
            parse_sitemap(xml),
            SitemapDoc::UrlSet(vec![
                "https://a.test/one".to_string(),
                "https://a.test/two".to_string(),
            ])
        );
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"<sitemapindex>
              <sitemap><loc>https://a.test/sitemap-1.xml</loc></sitemap>
              <sitemap><loc>https://a.test/sitemap-2.xml</loc></sitemap>
            </sitemapindex>"#;
        assert_eq!(
            parse_sitemap(xml),
            SitemapDoc::Index(vec![
                "https://a.test/sitemap-1.xml".to_string(),
                "https://a.test/sitemap-2.xml".to_string(),
            ])
        );
    }

    #[test]
    fn rejects_non_sitemap_documents() {
        assert_eq!(parse_sitemap("<html><body/></html>"), SitemapDoc::Unrecognized);
        assert_eq!(parse_sitemap("not xml at all"), SitemapDoc::Unrecognized);
        assert_eq!(parse_sitemap("<urlset></urlset>"), SitemapDoc::Unrecognized);
    }

    #[test]
    fn entity_escapes_are_resolved() {
        let xml = "<urlset><url><loc>https://a.test/a&amp;b</loc></url></urlset>";
        assert_eq!(
            parse_sitemap(xml),
            SitemapDoc::UrlSet(vec!["https://a.test/a&b".to_string()])
        );
    }
}
