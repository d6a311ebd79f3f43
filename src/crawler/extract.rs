//! HTML extraction: one DOM walk collecting metadata, readable body
//! text, and the link/image/PDF candidates the crawler acts on.

use std::collections::HashSet;

use ego_tree::NodeRef;
use scraper::{Html, Node};

use crate::models::{Link, PageData};
use crate::urls;

/// Elements whose subtree never contributes to the readable body.
const SKIP_ANCESTORS: &[&str] = &[
    "nav", "footer", "aside", "script", "style", "noscript", "header",
];

/// id/class fragments that mark page chrome rather than content.
const SKIP_PATTERNS: &[&str] = &["nav", "menu", "footer", "sidebar", "comment", "ad"];

/// Inline-JS fragments scrubbed out of extracted text.
const SCRIPT_ARTIFACTS: &[&str] = &[
    "JavaScript",
    "document.write",
    "function()",
    "var ",
    "const ",
    "let ",
    "window.",
    "document.",
    "addEventListener",
];

/// Text nodes shorter than this are noise (icons, separators) and dropped.
const MIN_TEXT_CHARS: usize = 4;

/// An image referenced from an allowed origin, pending download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    /// Absolute image URL.
    pub url: String,
    /// Alt text, possibly empty.
    pub alt: String,
}

/// Everything one extraction pass produces.
#[derive(Debug)]
pub struct Extraction {
    /// The partially-filled page record (fetch metadata is added by the caller).
    pub page: PageData,
    /// Allowed-origin images to download.
    pub image_candidates: Vec<ImageCandidate>,
    /// Allowed-origin PDF URLs to hand to the PDF pipeline.
    pub pdf_links: Vec<String>,
    /// Allowed-origin page links to enqueue.
    pub crawl_links: Vec<Link>,
}

/// Walks the parsed document and gathers page data plus follow-up work.
pub fn extract_page(
    html: &str,
    url: &str,
    host: &str,
    scheme: &str,
    allowed_hosts: &HashSet<String>,
) -> Extraction {
    let document = Html::parse_document(html);
    let mut walker = Walker {
        host,
        scheme,
        allowed_hosts,
        out: Extraction {
            page: PageData::new(url),
            image_candidates: Vec::new(),
            pdf_links: Vec::new(),
            crawl_links: Vec::new(),
        },
    };
    walker.walk(document.tree.root());

    let mut out = walker.out;
    out.page.main_content = clean_content(&out.page.main_content);
    out.page.refresh_word_count();
    out
}

struct Walker<'a> {
    host: &'a str,
    scheme: &'a str,
    allowed_hosts: &'a HashSet<String>,
    out: Extraction,
}

impl Walker<'_> {
    fn walk(&mut self, node: NodeRef<'_, Node>) {
        if let Some(element) = node.value().as_element() {
            match element.name() {
                "title" => {
                    if self.out.page.title.is_empty() {
                        let text = text_content(node);
                        if !text.is_empty() {
                            self.out.page.title = text;
                        }
                    }
                }
                "meta" => self.visit_meta(node),
                tag @ ("h1" | "h2" | "h3" | "h4" | "h5" | "h6") => {
                    let text = text_content(node);
                    if !text.is_empty() {
                        self.out
                            .page
                            .headings
                            .entry(tag.to_string())
                            .or_default()
                            .push(text);
                    }
                }
                "img" => self.visit_img(node),
                "a" => self.visit_anchor(node),
                "link" => self.visit_link(node),
                _ => {}
            }
        }

        if let Some(text) = node.value().as_text() {
            let trimmed = text.trim();
            if trimmed.chars().count() >= MIN_TEXT_CHARS && is_main_content(node) {
                self.out.page.main_content.push(' ');
                self.out.page.main_content.push_str(trimmed);
            }
        }

        for child in node.children() {
            self.walk(child);
        }
    }

    fn visit_meta(&mut self, node: NodeRef<'_, Node>) {
        let element = node.value().as_element().expect("meta node");
        let name = element.attr("name").unwrap_or_default();
        let property = element.attr("property").unwrap_or_default();
        let content = element.attr("content").unwrap_or_default();

        if name == "description" || property == "og:description" {
            if self.out.page.meta_description.is_empty() {
                self.out.page.meta_description = content.to_string();
            }
        } else if name == "keywords" {
            self.out.page.meta_keywords = content.to_string();
        } else if name == "language" || property == "og:locale" {
            self.out.page.language = content.to_string();
        } else if property == "og:title" && self.out.page.title.is_empty() {
            self.out.page.title = content.to_string();
        }
    }

    fn visit_img(&mut self, node: NodeRef<'_, Node>) {
        let element = node.value().as_element().expect("img node");
        let alt = element.attr("alt").unwrap_or_default();
        if !alt.is_empty() {
            self.out.page.image_alt.push(alt.to_string());
        }
        if let Some(src) = element.attr("src").filter(|src| !src.is_empty()) {
            let full = urls::resolve_href(src, self.host, self.scheme);
            if urls::is_allowed_host(&full, self.allowed_hosts) {
                self.out.image_candidates.push(ImageCandidate {
                    url: full,
                    alt: alt.to_string(),
                });
            }
        }
    }

    fn visit_anchor(&mut self, node: NodeRef<'_, Node>) {
        let element = node.value().as_element().expect("anchor node");
        if element
            .attr("rel")
            .is_some_and(|rel| rel.contains("nofollow"))
        {
            return;
        }
        let Some(href) = element.attr("href") else {
            return;
        };
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            return;
        }

        let link_text = text_content(node);
        if !link_text.is_empty() {
            self.out.page.link_text.push(link_text.clone());
        }

        let full = urls::resolve_href(href, self.host, self.scheme);
        let Ok(clean) = urls::canonicalize(&full) else {
            return;
        };

        let allowed = urls::is_allowed_host(&clean, self.allowed_hosts);
        if urls::is_pdf_url(&clean) && allowed {
            self.out.pdf_links.push(clean);
            return;
        }

        self.out.page.outbound_links.push(Link {
            text: link_text.clone(),
            url: clean.clone(),
        });
        if allowed {
            self.out.crawl_links.push(Link {
                text: link_text,
                url: clean,
            });
        }
    }

    fn visit_link(&mut self, node: NodeRef<'_, Node>) {
        let element = node.value().as_element().expect("link node");
        let rel = element.attr("rel").unwrap_or_default();
        let href = element.attr("href").unwrap_or_default();

        if rel == "canonical" {
            self.out.page.canonical = href.to_string();
        } else if (rel == "icon" || rel == "shortcut icon" || rel.contains("icon"))
            && !href.is_empty()
            && self.out.page.favicon.is_empty()
        {
            self.out.page.favicon = urls::resolve_href(href, self.host, self.scheme);
        }
    }
}

/// Concatenated descendant text, single-space separated and trimmed.
fn text_content(node: NodeRef<'_, Node>) -> String {
    let mut out = String::new();
    collect_text(node, &mut out);
    out
}

fn collect_text(node: NodeRef<'_, Node>, out: &mut String) {
    if let Some(text) = node.value().as_text() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(trimmed);
        }
    }
    for child in node.children() {
        collect_text(child, out);
    }
}

/// Decides whether a text node belongs to the readable body. The nearest
/// decisive ancestor wins: chrome elements and chrome-named containers
/// reject, `main`/`article` accept.
fn is_main_content(node: NodeRef<'_, Node>) -> bool {
    for ancestor in node.ancestors() {
        let Some(element) = ancestor.value().as_element() else {
            continue;
        };
        if SKIP_ANCESTORS.contains(&element.name()) {
            return false;
        }
        if let Some(id) = element.attr("id") {
            let id = id.to_lowercase();
            if SKIP_PATTERNS.iter().any(|pattern| id.contains(pattern)) {
                return false;
            }
        }
        if let Some(class) = element.attr("class") {
            let class = class.to_lowercase();
            if SKIP_PATTERNS.iter().any(|pattern| class.contains(pattern)) {
                return false;
            }
        }
        if matches!(element.name(), "main" | "article") {
            return true;
        }
    }
    true
}

/// Normalizes extracted text: strips C0 controls (keeping TAB/LF/CR),
/// collapses whitespace runs, and scrubs inline-JS artifacts.
pub fn clean_content(content: &str) -> String {
    let without_controls: String = content
        .chars()
        .filter(|&ch| !ch.is_control() || ch == '\t' || ch == '\n' || ch == '\r')
        .collect();

    let mut collapsed = without_controls
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    for artifact in SCRIPT_ARTIFACTS {
        collapsed = collapsed.replace(artifact, "");
    }
    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> HashSet<String> {
        list.iter().map(|h| h.to_string()).collect()
    }

    fn extract(html: &str) -> Extraction {
        extract_page(
            html,
            "https://a.test/page",
            "a.test",
            "https",
            &hosts(&["a.test"]),
        )
    }

    #[test]
    fn collects_title_meta_and_headings() {
        let out = extract(
            r#"<html><head>
                <title>Archive Home</title>
                <meta name="description" content="An archive">
                <meta name="keywords" content="archive,web">
                <meta property="og:locale" content="en_US">
                <link rel="canonical" href="https://a.test/canonical">
                <link rel="icon" href="/favicon.ico">
            </head><body>
                <h1>Welcome friends</h1><h2>Subheading here</h2>
            </body></html>"#,
        );
        assert_eq!(out.page.title, "Archive Home");
        assert_eq!(out.page.meta_description, "An archive");
        assert_eq!(out.page.meta_keywords, "archive,web");
        assert_eq!(out.page.language, "en_US");
        assert_eq!(out.page.canonical, "https://a.test/canonical");
        assert_eq!(out.page.favicon, "https://a.test/favicon.ico");
        assert_eq!(out.page.headings["h1"], vec!["Welcome friends"]);
        assert_eq!(out.page.headings["h2"], vec!["Subheading here"]);
    }

    #[test]
    fn og_title_is_only_a_fallback() {
        let out = extract(
            r#"<head><meta property="og:title" content="OG Title"></head>"#,
        );
        assert_eq!(out.page.title, "OG Title");

        let out = extract(
            r#"<head><title>Real Title</title>
               <meta property="og:title" content="OG Title"></head>"#,
        );
        assert_eq!(out.page.title, "Real Title");
    }

    #[test]
    fn chrome_text_is_excluded_from_main_content() {
        let out = extract(
            r#"<body>
                <nav>navigation words here</nav>
                <div class="sidebar">sidebar words here</div>
                <div id="main-footer">footer words here</div>
                <p>actual readable body text</p>
                <script>var hidden = "script text here";</script>
            </body>"#,
        );
        assert!(out.page.main_content.contains("actual readable body text"));
        assert!(!out.page.main_content.contains("navigation"));
        assert!(!out.page.main_content.contains("sidebar"));
        assert!(!out.page.main_content.contains("footer words"));
        assert!(!out.page.main_content.contains("hidden"));
    }

    #[test]
    fn article_overrides_an_outer_chrome_container() {
        let out = extract(
            r#"<div class="ad-wrapper"><article><p>inside the article body</p></article></div>"#,
        );
        // The article ancestor is closer than the chrome-named div.
        assert!(out.page.main_content.contains("inside the article body"));
    }

    #[test]
    fn short_text_nodes_are_dropped() {
        let out = extract("<body><p>abc</p><p>long enough text</p></body>");
        assert!(!out.page.main_content.contains("abc"));
        assert!(out.page.main_content.contains("long enough text"));
    }

    #[test]
    fn anchors_are_classified() {
        let out = extract(
            r##"<body>
                <a href="/next">Next page</a>
                <a href="https://other.test/away">External link</a>
                <a href="#top">Top anchor</a>
                <a href="mailto:a@a.test">Mail someone</a>
                <a href="/secret" rel="nofollow">No follow</a>
                <a href="/paper.pdf">A paper</a>
                <a href="https://other.test/doc.pdf">Foreign pdf</a>
            </body>"##,
        );
        let outbound: Vec<&str> = out
            .page
            .outbound_links
            .iter()
            .map(|l| l.url.as_str())
            .collect();
        assert!(outbound.contains(&"https://a.test/next"));
        assert!(outbound.contains(&"https://other.test/away"));
        // Allowed-origin PDFs go to the PDF pipeline, not outbound links.
        assert!(!outbound.contains(&"https://a.test/paper.pdf"));
        assert_eq!(out.pdf_links, vec!["https://a.test/paper.pdf"]);
        // Foreign PDFs are recorded but neither crawled nor processed.
        assert!(outbound.contains(&"https://other.test/doc.pdf"));

        let crawl: Vec<&str> = out.crawl_links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(crawl, vec!["https://a.test/next"]);

        assert!(out.page.link_text.contains(&"Next page".to_string()));
        assert!(!out.page.link_text.contains(&"No follow".to_string()));
    }

    #[test]
    fn anchor_queries_are_canonicalized_away() {
        let out = extract(r#"<a href="/next?page=2#frag">Next</a>"#);
        assert_eq!(out.crawl_links[0].url, "https://a.test/next");
    }

    #[test]
    fn images_split_into_alts_and_candidates() {
        let out = extract(
            r#"<body>
                <img src="/local.png" alt="local diagram">
                <img src="https://cdn.other.test/far.png" alt="remote art">
                <img src="/plain.png">
            </body>"#,
        );
        assert_eq!(out.page.image_alt, vec!["local diagram", "remote art"]);
        let candidates: Vec<&str> = out.image_candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(candidates, vec!["https://a.test/local.png", "https://a.test/plain.png"]);
    }

    #[test]
    fn clean_content_scrubs_controls_and_artifacts() {
        let cleaned = clean_content("hello\u{0}\u{8} world\u{7f}  with  JavaScript noise");
        assert_eq!(cleaned, "hello world with noise");
    }

    #[test]
    fn clean_content_collapses_whitespace() {
        assert_eq!(clean_content("  a\t\tb\n\nc  "), "a b c");
    }

    #[test]
    fn word_count_matches_main_content_tokens() {
        let out = extract("<p>five words are in here</p>");
        assert_eq!(
            out.page.word_count,
            out.page.main_content.split_whitespace().count()
        );
    }
}
