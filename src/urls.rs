//! URL canonicalization, host allow-listing, and stable point IDs.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{ArchiveError, Result};

/// Suffixes that mark a URL as binary or otherwise non-crawlable content.
const BINARY_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp", ".svg", ".doc", ".docx", ".xls", ".xlsx",
    ".ppt", ".pptx", ".zip", ".rar", ".tar", ".gz", ".7z", ".mp3", ".mp4", ".wav", ".avi", ".mov",
    ".wmv", ".css", ".js", ".ico", ".xml", ".json", ".php",
];

/// Query fragments that hint at a file download rather than a page.
const DOWNLOAD_HINTS: &[&str] = &["download=", "attachment=", "export="];

/// Strips the fragment and query from a URL and returns the reconstructed form.
///
/// Canonicalization is idempotent: feeding the output back in yields the
/// same string.
pub fn canonicalize(raw: &str) -> Result<String> {
    let mut parsed = Url::parse(raw).map_err(|source| ArchiveError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    parsed.set_fragment(None);
    parsed.set_query(None);
    Ok(parsed.to_string())
}

/// Derives a stable 36-character UUID-shaped ID from a URL.
///
/// The ID is the first 16 bytes of SHA-256(url) formatted as
/// `8-4-4-4-12` hex groups. Equal URLs always map to equal IDs, which is
/// what keeps vector upserts idempotent across crawls.
pub fn deterministic_id(url: &str) -> String {
    let hash = Sha256::digest(url.as_bytes());
    format!(
        "{}-{}-{}-{}-{}",
        hex(&hash[0..4]),
        hex(&hash[4..6]),
        hex(&hash[6..8]),
        hex(&hash[8..10]),
        hex(&hash[10..16]),
    )
}

/// Hex digest prefix used for on-disk image and PDF basenames.
pub fn file_basename_stem(url: &str) -> String {
    let hash = Sha256::digest(url.as_bytes());
    hex(&hash[0..16])
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Returns the host component of a URL, if it parses.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// True when the URL's host is in the allow-list. Parse errors are
/// treated as not allowed.
pub fn is_allowed_host(url: &str, allowed_hosts: &HashSet<String>) -> bool {
    match host_of(url) {
        Some(host) => allowed_hosts.contains(&host),
        None => false,
    }
}

/// Resolves an href against the page's scheme and host.
///
/// Absolute forms pass through, `//…` gains `https:`, `/…` is joined to
/// the origin, and anything else is joined below the origin root.
pub fn resolve_href(href: &str, host: &str, scheme: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix("//") {
        format!("https://{rest}")
    } else if href.starts_with('/') {
        format!("{scheme}://{host}{href}")
    } else {
        format!("{scheme}://{host}/{href}")
    }
}

/// True when the URL points at binary content or a download endpoint
/// that the page crawler should not fetch.
pub fn should_skip_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    if BINARY_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return true;
    }
    DOWNLOAD_HINTS.iter().any(|hint| lower.contains(hint))
}

/// True when the URL targets a PDF document.
pub fn is_pdf_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.ends_with(".pdf") || lower.contains(".pdf?")
}

/// Removes any trailing slashes before the page record is persisted.
pub fn strip_trailing_slash(url: &str) -> &str {
    url.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_fragment_and_query() {
        let url = canonicalize("https://a.test/page?x=1&y=2#section").unwrap();
        assert_eq!(url, "https://a.test/page");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let once = canonicalize("https://a.test/path?q=1#f").unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn canonicalize_rejects_garbage() {
        assert!(matches!(
            canonicalize("not a url"),
            Err(ArchiveError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn deterministic_id_is_stable_and_uuid_shaped() {
        let a = deterministic_id("https://a.test/x");
        let b = deterministic_id("https://a.test/x");
        let c = deterministic_id("https://a.test/y");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 36);
        let groups: Vec<&str> = a.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(a
            .chars()
            .all(|ch| ch == '-' || ch.is_ascii_hexdigit()));
    }

    #[test]
    fn allowed_host_requires_exact_match() {
        let hosts: HashSet<String> = ["a.test".to_string()].into_iter().collect();
        assert!(is_allowed_host("https://a.test/page", &hosts));
        assert!(!is_allowed_host("https://sub.a.test/page", &hosts));
        assert!(!is_allowed_host("not a url", &hosts));
    }

    #[test]
    fn resolve_href_handles_all_forms() {
        assert_eq!(
            resolve_href("https://b.test/x", "a.test", "https"),
            "https://b.test/x"
        );
        assert_eq!(
            resolve_href("//cdn.test/img", "a.test", "https"),
            "https://cdn.test/img"
        );
        assert_eq!(
            resolve_href("/about", "a.test", "https"),
            "https://a.test/about"
        );
        assert_eq!(
            resolve_href("about", "a.test", "http"),
            "http://a.test/about"
        );
    }

    #[test]
    fn skip_detection_covers_suffixes_and_hints() {
        assert!(should_skip_url("https://a.test/style.css"));
        assert!(should_skip_url("https://a.test/archive.ZIP"));
        assert!(should_skip_url("https://a.test/file?download=1"));
        assert!(!should_skip_url("https://a.test/article"));
    }

    #[test]
    fn pdf_detection() {
        assert!(is_pdf_url("https://a.test/doc.pdf"));
        assert!(is_pdf_url("https://a.test/doc.PDF?version=2"));
        assert!(!is_pdf_url("https://a.test/pdf-guide"));
    }

    #[test]
    fn trailing_slash_stripped() {
        assert_eq!(strip_trailing_slash("https://a.test/page//"), "https://a.test/page");
        assert_eq!(strip_trailing_slash("https://a.test/page"), "https://a.test/page");
    }
}
