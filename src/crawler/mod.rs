//! Bounded, polite, concurrent BFS crawler over an allow-listed origin set.
//!
//! N workers pull from one shared queue; sitemap discovery and PDF
//! processing run on background tasks and feed the same queue and
//! stores. Per-URL failures are absorbed so one bad page never stops
//! the crawl.

pub mod extract;
pub mod media;
pub mod pdf;
pub mod queue;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::db::PageStore;
use crate::embedding::EmbeddingClient;
use crate::error::{ArchiveError, Result};
use crate::models::{ImageData, PageData};
use crate::robots::RobotsCache;
use crate::sitemap;
use crate::urls;
use crate::vector::{VectorStore, PAGE_COLLECTION, PDF_COLLECTION};

use self::extract::Extraction;
use self::pdf::PdfPipeline;
use self::queue::CrawlQueue;

/// User-Agent presented on every crawl fetch.
pub const BOT_USER_AGENT: &str = "TheLastArchiveBot/1.0";

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_MAX_BYTES: usize = 10 * 1024 * 1024;
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_EMPTY: usize = 10;
const STORE_ATTEMPTS: usize = 3;

/// Tunable crawl knobs.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Sleep between fetches on one worker.
    pub pacing: Duration,
    /// Pages with less readable text than this are not persisted.
    pub min_content_chars: usize,
    /// Directory receiving downloaded images.
    pub images_dir: PathBuf,
    /// Directory receiving downloaded PDFs.
    pub pdfs_dir: PathBuf,
    /// Words per PDF chunk.
    pub chunk_size: usize,
    /// Words shared between neighboring PDF chunks.
    pub chunk_overlap: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            pacing: Duration::from_secs(2),
            min_content_chars: 500,
            images_dir: PathBuf::from("images"),
            pdfs_dir: PathBuf::from("pdfs"),
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// The crawler aggregate owning the queue, dedup state, and store handles.
pub struct Crawler {
    queue: Arc<CrawlQueue>,
    http: reqwest::Client,
    robots: RobotsCache,
    db: PageStore,
    vector: VectorStore,
    embedding: EmbeddingClient,
    pdf: Arc<PdfPipeline>,
    pdf_tasks: TaskTracker,
    cancel: CancellationToken,
    config: CrawlConfig,
    pages_crawled: AtomicUsize,
}

impl Crawler {
    /// Builds a crawler whose allow-list is derived from the seed URLs.
    /// Ensures the media directories and vector collections exist.
    pub async fn new(
        db: PageStore,
        vector: VectorStore,
        embedding: EmbeddingClient,
        cancel: CancellationToken,
        config: CrawlConfig,
        seeds: &[String],
    ) -> anyhow::Result<Arc<Self>> {
        anyhow::ensure!(!seeds.is_empty(), "at least one seed URL is required");

        let mut allowed_hosts = HashSet::new();
        let mut base_domain = None;
        for seed in seeds {
            match urls::host_of(seed) {
                Some(host) => {
                    if base_domain.is_none() {
                        base_domain = Some(host.clone());
                    }
                    info!(%host, "allowed host added");
                    allowed_hosts.insert(host);
                }
                None => warn!(%seed, "seed URL has no host, skipping"),
            }
        }
        anyhow::ensure!(
            !allowed_hosts.is_empty(),
            "no seed URL yielded a usable host"
        );
        info!(base_domain = base_domain.as_deref().unwrap_or(""), "crawl scope fixed");

        std::fs::create_dir_all(&config.images_dir)?;
        std::fs::create_dir_all(&config.pdfs_dir)?;

        vector.ensure_collection(PAGE_COLLECTION).await?;
        vector.ensure_collection(PDF_COLLECTION).await?;

        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        let pdf = Arc::new(PdfPipeline::new(
            http.clone(),
            config.pdfs_dir.clone(),
            embedding.clone(),
            vector.clone(),
            cancel.clone(),
            config.chunk_size,
            config.chunk_overlap,
        ));

        Ok(Arc::new(Self {
            queue: Arc::new(CrawlQueue::new(allowed_hosts)),
            robots: RobotsCache::new(http.clone()),
            http,
            db,
            vector,
            embedding,
            pdf,
            pdf_tasks: TaskTracker::new(),
            cancel,
            config,
            pages_crawled: AtomicUsize::new(0),
        }))
    }

    /// Shared queue handle, exposed for sitemap discovery and tests.
    pub fn queue(&self) -> &Arc<CrawlQueue> {
        &self.queue
    }

    /// Seeds the queue, launches sitemap discovery and the worker pool,
    /// and waits for the crawl to drain or be cancelled.
    pub async fn run(self: Arc<Self>, seeds: Vec<String>) {
        for (index, seed) in seeds.iter().enumerate() {
            info!(%seed, index = index + 1, total = seeds.len(), "queueing seed URL");
            self.queue.enqueue(crate::models::Link::bare(seed));
        }
        info!(queued = self.queue.len(), "seed URLs added to queue");

        // Sitemaps feed the same queue under the same dedup rules while
        // the workers are already crawling.
        {
            let crawler = Arc::clone(&self);
            tokio::spawn(async move {
                for seed in &seeds {
                    let Ok(parsed) = url::Url::parse(seed) else {
                        continue;
                    };
                    let Some(host) = parsed.host_str() else {
                        continue;
                    };
                    let base = format!("{}://{host}", parsed.scheme());
                    sitemap::discover(&crawler.http, &base, &crawler.queue).await;
                }
            });
        }

        let workers: Vec<_> = (0..self.config.worker_count.max(1))
            .map(|id| {
                let crawler = Arc::clone(&self);
                tokio::spawn(async move { crawler.worker_loop(id).await })
            })
            .collect();
        join_all(workers).await;

        // Join point for in-flight PDF work before the stores shut down.
        self.pdf_tasks.close();
        self.pdf_tasks.wait().await;

        info!(
            pages = self.pages_crawled.load(Ordering::Relaxed),
            visited = self.queue.visited_count(),
            "all workers done"
        );
    }

    async fn worker_loop(self: &Arc<Self>, id: usize) {
        let mut consecutive_empty = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                info!(worker = id, "stop signal observed");
                return;
            }

            let Some(link) = self.queue.dequeue() else {
                consecutive_empty += 1;
                if consecutive_empty >= MAX_CONSECUTIVE_EMPTY {
                    info!(worker = id, "queue stayed empty, exiting");
                    return;
                }
                debug!(
                    worker = id,
                    attempt = consecutive_empty,
                    "queue empty, waiting"
                );
                if !self.sleep_cancellable(EMPTY_QUEUE_SLEEP).await {
                    return;
                }
                continue;
            };

            consecutive_empty = 0;
            debug!(worker = id, url = %link.url, queued = self.queue.len(), "dequeued");
            match self.crawl_page(&link.url).await {
                Ok(()) => {}
                Err(err) if err.is_skip() => debug!(worker = id, url = %link.url, reason = %err, "skipped"),
                Err(err) => warn!(worker = id, url = %link.url, error = %err, "crawl failed"),
            }

            if !self.sleep_cancellable(self.config.pacing).await {
                return;
            }
        }
    }

    /// Crawls one URL. The URL counts as attempted whether or not the
    /// crawl succeeded, so it is never re-queued within this run.
    pub async fn crawl_page(self: &Arc<Self>, page_url: &str) -> Result<()> {
        self.pages_crawled.fetch_add(1, Ordering::Relaxed);
        let result = self.crawl_page_inner(page_url).await;
        self.queue.mark_seen(page_url);
        result
    }

    async fn crawl_page_inner(self: &Arc<Self>, page_url: &str) -> Result<()> {
        if self.queue.is_seen(page_url) {
            return Err(ArchiveError::SkippedContent("already visited".to_string()));
        }
        if urls::should_skip_url(page_url) {
            return Err(ArchiveError::SkippedContent(
                "binary or download URL".to_string(),
            ));
        }

        let parsed = url::Url::parse(page_url).map_err(|source| ArchiveError::InvalidUrl {
            url: page_url.to_string(),
            source,
        })?;
        let scheme = parsed.scheme().to_string();
        let host = parsed.host_str().unwrap_or_default().to_string();
        let origin = format!("{scheme}://{host}");

        self.robots.check(&origin, parsed.path()).await?;

        let started = Instant::now();
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ArchiveError::ShutdownRequested),
            sent = self
                .http
                .get(page_url)
                .header(reqwest::header::USER_AGENT, BOT_USER_AGENT)
                .header(reqwest::header::ACCEPT, ACCEPT_HTML)
                .send() => sent.map_err(|err| ArchiveError::FetchFailed {
                    url: page_url.to_string(),
                    reason: err.to_string(),
                })?,
        };
        let response_time = started.elapsed();

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(ArchiveError::FetchFailed {
                url: page_url.to_string(),
                reason: format!("status {status}"),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_html_content(&content_type) {
            return Err(ArchiveError::SkippedContent(format!(
                "non-HTML content type: {content_type}"
            )));
        }
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| chrono::DateTime::parse_from_rfc2822(value).ok())
            .map(|value| value.with_timezone(&Utc));

        let body = self.read_body_capped(response, page_url).await?;
        let html = String::from_utf8_lossy(&body);

        let Extraction {
            mut page,
            image_candidates,
            pdf_links,
            crawl_links,
        } = extract::extract_page(&html, page_url, &host, &scheme, self.queue.allowed_hosts());

        page.status_code = status.as_u16();
        page.response_time_ms = response_time.as_millis() as u64;
        page.content_type = content_type;
        page.last_modified = last_modified;

        // PDFs run on background tasks; the page record does not wait for
        // them, it picks up whatever happens to finish in-band.
        let completed_pdfs: Arc<tokio::sync::Mutex<Vec<crate::models::PdfData>>> =
            Arc::new(tokio::sync::Mutex::new(Vec::new()));
        for pdf_url in pdf_links {
            if !self.queue.claim_pdf(&pdf_url) {
                debug!(%pdf_url, "pdf already claimed");
                continue;
            }
            let pipeline = Arc::clone(&self.pdf);
            let completed = Arc::clone(&completed_pdfs);
            let page_owner = page.url.clone();
            self.pdf_tasks.spawn(async move {
                match pipeline.process(&pdf_url, &page_owner).await {
                    Ok(pdf) => {
                        info!(%pdf_url, bytes = pdf.file_size, "pdf processed");
                        completed.lock().await.push(pdf);
                    }
                    Err(err) if err.is_skip() => debug!(%pdf_url, reason = %err, "pdf skipped"),
                    Err(err) => warn!(%pdf_url, error = %err, "pdf processing failed"),
                }
            });
        }

        for link in crawl_links {
            self.queue.enqueue(link);
        }

        for candidate in image_candidates {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::ShutdownRequested);
            }
            match media::download_image(&self.http, &self.config.images_dir, &candidate.url, &page.url)
                .await
            {
                Ok(path) => page.images.push(ImageData {
                    url: candidate.url,
                    alt: candidate.alt,
                    local_path: path.display().to_string(),
                }),
                Err(err) => debug!(image = %candidate.url, reason = %err, "image not kept"),
            }
        }

        if page.main_content.chars().count() < self.config.min_content_chars {
            return Err(ArchiveError::SkippedContent(format!(
                "content too short ({} chars)",
                page.main_content.chars().count()
            )));
        }

        page.url = urls::strip_trailing_slash(&page.url).to_string();
        page.pdfs = {
            let mut completed = completed_pdfs.lock().await;
            std::mem::take(&mut *completed)
        };

        self.persist_with_retry(&page).await?;
        info!(
            url = %page.url,
            words = page.word_count,
            links = page.outbound_links.len(),
            images = page.images.len(),
            "page archived"
        );
        Ok(())
    }

    async fn read_body_capped(&self, mut response: reqwest::Response, page_url: &str) -> Result<Vec<u8>> {
        let mut body: Vec<u8> = Vec::new();
        loop {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::ShutdownRequested);
            }
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = PAGE_MAX_BYTES.saturating_sub(body.len());
                    if remaining == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                }
                Ok(None) => break,
                Err(err) => {
                    return Err(ArchiveError::FetchFailed {
                        url: page_url.to_string(),
                        reason: format!("read body: {err}"),
                    })
                }
            }
        }
        Ok(body)
    }

    /// Persists to both stores with up to three attempts and quadratic
    /// backoff. Each attempt health-checks the relational store first.
    async fn persist_with_retry(&self, page: &PageData) -> Result<()> {
        let mut last_err = ArchiveError::StoreUnavailable("no attempts made".to_string());
        for attempt in 1..=STORE_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::ShutdownRequested);
            }

            if let Err(err) = self.db.health_check().await {
                warn!(url = %page.url, attempt, error = %err, "store health check failed");
                last_err = err;
            } else {
                match self.persist(page).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        warn!(url = %page.url, attempt, error = %err, "persist attempt failed");
                        last_err = err;
                    }
                }
            }

            if attempt < STORE_ATTEMPTS {
                let backoff = Duration::from_secs((attempt * attempt) as u64);
                if !self.sleep_cancellable(backoff).await {
                    return Err(ArchiveError::ShutdownRequested);
                }
            }
        }
        Err(last_err)
    }

    /// One persistence pass: the relational transaction, then the page
    /// vector point. The page row is kept even when the vector side
    /// fails; the returned error drives a retry and re-upserting the row
    /// is harmless.
    async fn persist(&self, page: &PageData) -> Result<()> {
        let page_id = self.db.upsert_page(page).await?;
        debug!(url = %page.url, page_id, "page row upserted");

        let embedding = self.embedding.embed(&page.main_content).await?;
        if let Err(err) = self.vector.upsert_page(page, &embedding.vector).await {
            warn!(url = %page.url, error = %err, "vector upsert failed, page row kept");
            return Err(err);
        }
        Ok(())
    }

    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

fn is_html_content(content_type: &str) -> bool {
    if content_type.is_empty() {
        return true;
    }
    let lower = content_type.to_lowercase();
    ["text/html", "application/xhtml+xml", "text/plain"]
        .iter()
        .any(|kind| lower.contains(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_content_type_detection() {
        assert!(is_html_content(""));
        assert!(is_html_content("text/html; charset=utf-8"));
        assert!(is_html_content("application/xhtml+xml"));
        assert!(!is_html_content("application/pdf"));
        assert!(!is_html_content("image/png"));
    }

    #[test]
    fn default_config_matches_the_polite_profile() {
        let config = CrawlConfig::default();
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.pacing, Duration::from_secs(2));
        assert_eq!(config.min_content_chars, 500);
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.chunk_overlap, 50);
    }
}
