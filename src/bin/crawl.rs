use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lastarchive::crawler::{CrawlConfig, Crawler};
use lastarchive::{telemetry, EmbeddingClient, PageStore, VectorStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace period for workers to drain after a shutdown signal.
const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(10);

/// Grace period for the page store to close.
const STORE_CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "lastarchive-crawl",
    about = "Crawl allow-listed sites into the archive stores"
)]
struct CrawlCli {
    /// Seed URLs; their hosts define the crawl scope
    #[arg(required = true)]
    seeds: Vec<String>,

    /// Number of concurrent crawl workers
    #[arg(long, env = "CRAWL_WORKERS", default_value_t = 5)]
    workers: usize,

    /// Milliseconds a worker sleeps between fetches
    #[arg(long, env = "CRAWL_PACING_MS", default_value_t = 2000)]
    pacing_ms: u64,

    /// Minimum readable characters before a page is archived
    #[arg(long, env = "CRAWL_MIN_CONTENT", default_value_t = 500)]
    min_content: usize,

    /// SQLite database holding page and image records
    #[arg(long, env = "ARCHIVE_DB", default_value = "archive.db")]
    database: String,

    /// Vector store host
    #[arg(long, env = "QDRANT_HOST", default_value = "localhost")]
    qdrant_host: String,

    /// Vector store REST port
    #[arg(long, env = "QDRANT_PORT", default_value_t = 6333)]
    qdrant_port: u16,

    /// Vector store API key
    #[arg(long, env = "QDRANT_API_KEY")]
    qdrant_api_key: Option<String>,

    /// Base URL of the embedding service
    #[arg(long, env = "EMBEDDING_BASE_URL")]
    embedding_base_url: Option<String>,

    /// Words per PDF chunk
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 500)]
    chunk_size: usize,

    /// Overlapping words between neighboring PDF chunks
    #[arg(long, env = "CHUNK_OVERLAP", default_value_t = 50)]
    chunk_overlap: usize,

    /// Directory receiving downloaded images
    #[arg(long, default_value = "images")]
    images_dir: PathBuf,

    /// Directory receiving downloaded PDFs
    #[arg(long, default_value = "pdfs")]
    pdfs_dir: PathBuf,

    /// Append-only crawl log file
    #[arg(long, default_value = "crawler.log")]
    log_file: PathBuf,
}

impl CrawlCli {
    /// `EMBEDDING_BASE_URL` wins, `EMBEDDING_HOST` is the legacy name.
    fn embedding_base(&self) -> String {
        self.embedding_base_url
            .clone()
            .or_else(|| std::env::var("EMBEDDING_HOST").ok())
            .unwrap_or_else(|| "http://localhost:5050".to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CrawlCli::parse();
    telemetry::init(Some(&cli.log_file))?;
    info!(seeds = cli.seeds.len(), workers = cli.workers, "starting archive crawl");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let db = PageStore::open(&cli.database).await?;
    let vector = VectorStore::new(
        &cli.qdrant_host,
        cli.qdrant_port,
        cli.qdrant_api_key.clone(),
    )?;
    let embedding = EmbeddingClient::new(&cli.embedding_base())?;

    let config = CrawlConfig {
        worker_count: cli.workers,
        pacing: Duration::from_millis(cli.pacing_ms),
        min_content_chars: cli.min_content,
        images_dir: cli.images_dir.clone(),
        pdfs_dir: cli.pdfs_dir.clone(),
        chunk_size: cli.chunk_size,
        chunk_overlap: cli.chunk_overlap,
    };

    let crawler = Crawler::new(
        db.clone(),
        vector,
        embedding,
        cancel.clone(),
        config,
        &cli.seeds,
    )
    .await
    .context("failed to build crawler")?;

    crawler.run(cli.seeds.clone()).await;

    if let Err(err) = db.close(STORE_CLOSE_GRACE).await {
        error!(error = %err, "page store did not close cleanly");
    }
    info!("crawl finished");
    Ok(())
}

/// Cancels the root token on SIGINT/SIGTERM and force-exits when the
/// workers have not drained within the watchdog window.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("shutdown signal received, stopping crawler");
        cancel.cancel();

        tokio::spawn(async {
            tokio::time::sleep(SHUTDOWN_WATCHDOG).await;
            error!("shutdown watchdog fired, forcing exit");
            std::process::exit(1);
        });
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
