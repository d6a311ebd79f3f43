//! Shared crawl frontier: a FIFO of links guarded together with its
//! dedup sets so enqueue decisions are atomic.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::models::Link;
use crate::urls;

/// Mutex-protected queue shared by all crawl workers.
///
/// The allow-list is fixed at construction and never shrinks; membership
/// checks and queue mutations happen under a single lock so two workers
/// racing on the same URL produce exactly one queue entry.
pub struct CrawlQueue {
    allowed_hosts: HashSet<String>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    links: VecDeque<Link>,
    queued: HashSet<String>,
    visited: HashSet<String>,
    processed_pdfs: HashSet<String>,
}

impl CrawlQueue {
    /// Builds an empty queue for the given origin allow-list.
    pub fn new(allowed_hosts: HashSet<String>) -> Self {
        Self {
            allowed_hosts,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Hosts derived from the seed URLs.
    pub fn allowed_hosts(&self) -> &HashSet<String> {
        &self.allowed_hosts
    }

    /// Attempts to enqueue a link. Duplicates (already queued or already
    /// visited) and disallowed origins are dropped silently; returns
    /// whether the link was actually added.
    pub fn enqueue(&self, link: Link) -> bool {
        if !urls::is_allowed_host(&link.url, &self.allowed_hosts) {
            return false;
        }
        let mut state = self.state.lock().expect("crawl queue lock poisoned");
        if state.queued.contains(&link.url) || state.visited.contains(&link.url) {
            return false;
        }
        state.queued.insert(link.url.clone());
        state.links.push_back(link);
        true
    }

    /// Pops the oldest link, releasing its slot in the queued set.
    pub fn dequeue(&self) -> Option<Link> {
        let mut state = self.state.lock().expect("crawl queue lock poisoned");
        let link = state.links.pop_front()?;
        state.queued.remove(&link.url);
        Some(link)
    }

    /// Records that a crawl attempt happened for this URL, successful or not.
    pub fn mark_seen(&self, url: &str) {
        let mut state = self.state.lock().expect("crawl queue lock poisoned");
        state.visited.insert(url.to_string());
    }

    /// True when the URL has already been attempted.
    pub fn is_seen(&self, url: &str) -> bool {
        let state = self.state.lock().expect("crawl queue lock poisoned");
        state.visited.contains(url)
    }

    /// Atomically claims a PDF URL for processing. Returns false when the
    /// PDF was already claimed, guaranteeing at-most-once PDF work.
    pub fn claim_pdf(&self, url: &str) -> bool {
        let mut state = self.state.lock().expect("crawl queue lock poisoned");
        state.processed_pdfs.insert(url.to_string())
    }

    /// Number of links currently waiting.
    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("crawl queue lock poisoned");
        state.links.len()
    }

    /// True when no links are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of URLs attempted so far.
    pub fn visited_count(&self) -> usize {
        let state = self.state.lock().expect("crawl queue lock poisoned");
        state.visited.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue_for(hosts: &[&str]) -> CrawlQueue {
        CrawlQueue::new(hosts.iter().map(|h| h.to_string()).collect())
    }

    #[test]
    fn enqueue_then_dequeue_is_fifo() {
        let queue = queue_for(&["a.test"]);
        assert!(queue.enqueue(Link::bare("https://a.test/1")));
        assert!(queue.enqueue(Link::bare("https://a.test/2")));
        assert_eq!(queue.dequeue().unwrap().url, "https://a.test/1");
        assert_eq!(queue.dequeue().unwrap().url, "https://a.test/2");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn duplicate_enqueue_is_dropped() {
        let queue = queue_for(&["a.test"]);
        assert!(queue.enqueue(Link::bare("https://a.test/x")));
        assert!(!queue.enqueue(Link::bare("https://a.test/x")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn visited_urls_are_not_requeued() {
        let queue = queue_for(&["a.test"]);
        queue.mark_seen("https://a.test/x");
        assert!(!queue.enqueue(Link::bare("https://a.test/x")));
        assert!(queue.is_empty());
    }

    #[test]
    fn disallowed_origin_is_rejected() {
        let queue = queue_for(&["a.test"]);
        assert!(!queue.enqueue(Link::bare("https://other.test/x")));
        assert!(!queue.enqueue(Link::bare("::::not-a-url")));
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeue_releases_queued_slot() {
        let queue = queue_for(&["a.test"]);
        queue.enqueue(Link::bare("https://a.test/x"));
        let link = queue.dequeue().unwrap();
        // Not yet marked seen, so the URL may be enqueued again.
        assert!(queue.enqueue(Link::bare(link.url)));
    }

    #[test]
    fn pdf_claim_is_at_most_once() {
        let queue = queue_for(&["a.test"]);
        assert!(queue.claim_pdf("https://a.test/doc.pdf"));
        assert!(!queue.claim_pdf("https://a.test/doc.pdf"));
    }

    #[test]
    fn concurrent_enqueue_of_same_url_adds_once() {
        let queue = Arc::new(queue_for(&["a.test"]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                queue.enqueue(Link::bare("https://a.test/race"))
            }));
        }
        let added: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(added, 1);
        assert_eq!(queue.len(), 1);
    }
}
