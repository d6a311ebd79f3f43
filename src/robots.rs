//! robots.txt parsing and a per-origin rules cache.
//!
//! Only the wildcard (`*`) group is evaluated; this bot does not claim
//! any per-agent overrides.

use std::collections::HashMap;
use std::sync::RwLock;

use reqwest::StatusCode;

use crate::error::{ArchiveError, Result};

/// Directives parsed from a robots.txt wildcard group.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    disallow: Vec<String>,
    allow: Vec<String>,
}

impl RobotsRules {
    /// Parses robots.txt content, keeping only rules for the `*` group.
    pub fn parse(content: &str) -> Self {
        let mut rules = Self::default();
        let mut in_wildcard = false;
        let mut saw_directive = true;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    // A user-agent line after directives starts a new group.
                    if saw_directive {
                        in_wildcard = false;
                        saw_directive = false;
                    }
                    if value == "*" {
                        in_wildcard = true;
                    }
                }
                "disallow" if in_wildcard => {
                    saw_directive = true;
                    if !value.is_empty() {
                        rules.disallow.push(value.to_string());
                    }
                }
                "allow" if in_wildcard => {
                    saw_directive = true;
                    if !value.is_empty() {
                        rules.allow.push(value.to_string());
                    }
                }
                _ => {
                    saw_directive = true;
                }
            }
        }
        rules
    }

    /// Evaluates a path against the wildcard group. Allow prefixes win
    /// over disallow prefixes.
    pub fn is_allowed(&self, path: &str) -> bool {
        let path = if path.is_empty() { "/" } else { path };
        for allow in &self.allow {
            if path.starts_with(allow.as_str()) {
                return true;
            }
        }
        for disallow in &self.disallow {
            if path.starts_with(disallow.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Per-origin robots.txt cache with concurrent reads.
pub struct RobotsCache {
    client: reqwest::Client,
    cache: RwLock<HashMap<String, RobotsRules>>,
}

impl RobotsCache {
    /// Builds a cache that fetches robots.txt with the given client.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Checks whether `path` under `origin` (scheme+host) may be fetched.
    ///
    /// A missing robots.txt (404) allows everything and is not cached;
    /// rules are cached only after a successful fetch and parse.
    pub async fn check(&self, origin: &str, path: &str) -> Result<()> {
        let cached = {
            let cache = self.cache.read().expect("robots cache lock poisoned");
            cache.get(origin).cloned()
        };
        if let Some(rules) = cached {
            return verdict(&rules, path);
        }

        let robots_url = format!("{origin}/robots.txt");
        let response = self
            .client
            .get(&robots_url)
            .send()
            .await
            .map_err(|err| ArchiveError::FetchFailed {
                url: robots_url.clone(),
                reason: err.to_string(),
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(ArchiveError::FetchFailed {
                url: robots_url,
                reason: format!("status {}", response.status()),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| ArchiveError::FetchFailed {
                url: robots_url,
                reason: err.to_string(),
            })?;
        let rules = RobotsRules::parse(&body);

        {
            let mut cache = self.cache.write().expect("robots cache lock poisoned");
            cache.insert(origin.to_string(), rules.clone());
        }
        verdict(&rules, path)
    }
}

fn verdict(rules: &RobotsRules, path: &str) -> Result<()> {
    if rules.is_allowed(path) {
        Ok(())
    } else {
        Err(ArchiveError::BlockedByRobots {
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_disallow_blocks_prefix() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /private\n");
        assert!(!rules.is_allowed("/private"));
        assert!(!rules.is_allowed("/private/page"));
        assert!(rules.is_allowed("/public"));
    }

    #[test]
    fn allow_overrides_disallow() {
        let rules = RobotsRules::parse(
            "User-agent: *\nDisallow: /docs\nAllow: /docs/public\n",
        );
        assert!(rules.is_allowed("/docs/public/intro"));
        assert!(!rules.is_allowed("/docs/internal"));
    }

    #[test]
    fn other_agent_groups_are_ignored() {
        let rules = RobotsRules::parse(
            "User-agent: badbot\nDisallow: /\n\nUser-agent: *\nDisallow: /tmp\n",
        );
        assert!(rules.is_allowed("/anything"));
        assert!(!rules.is_allowed("/tmp/file"));
    }

    #[test]
    fn disallow_root_blocks_everything() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /\n");
        assert!(!rules.is_allowed("/"));
        assert!(!rules.is_allowed("/any"));
    }

    #[test]
    fn empty_file_allows_everything() {
        let rules = RobotsRules::parse("");
        assert!(rules.is_allowed("/any/path"));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let rules = RobotsRules::parse(
            "# welcome\nUser-agent: *\n\nDisallow: /a # inline\n",
        );
        assert!(!rules.is_allowed("/a/b"));
    }
}
