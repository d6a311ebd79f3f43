use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use lastarchive::rag::{RagConfig, RagEngine};
use lastarchive::server::{self, AppState, SearchLimiter};
use lastarchive::vector::{PAGE_COLLECTION, PDF_COLLECTION};
use lastarchive::{telemetry, EmbeddingClient, HistoryStore, LlmClient, PageStore, VectorStore};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "lastarchive-serve",
    about = "Archive API server: streaming search, sessions, health, stats"
)]
struct ServeCli {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// SQLite database holding page and image records
    #[arg(long, env = "ARCHIVE_DB", default_value = "archive.db")]
    database: String,

    /// SQLite database holding chat sessions
    #[arg(long, env = "SESSIONS_DB", default_value = "sessions.db")]
    sessions_database: String,

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

    /// Base URL of the language-model runtime
    #[arg(long, env = "LLAMA_BASE_URL", default_value = "http://localhost:1410")]
    llama_base_url: String,

    /// Model identifier requested from the runtime
    #[arg(long, env = "LLAMA_MODEL", default_value = "qwen:0.5b")]
    llama_model: String,

    /// Per-collection result cap for hybrid search
    #[arg(long, env = "MAX_SEARCH_RESULTS", default_value_t = 15)]
    max_search_results: usize,

    /// Documents kept after merge and re-rank
    #[arg(long, env = "RERANK_TOP_K", default_value_t = 5)]
    rerank_top_k: usize,

    /// Rate-limit window in milliseconds (0 disables)
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 60_000)]
    rate_limit_window_ms: u64,

    /// Requests allowed per window (0 disables)
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 120)]
    rate_limit_max_requests: u32,
}

impl ServeCli {
    fn embedding_base(&self) -> String {
        self.embedding_base_url
            .clone()
            .or_else(|| std::env::var("EMBEDDING_HOST").ok())
            .unwrap_or_else(|| "http://localhost:5050".to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ServeCli::parse();
    telemetry::init(None)?;

    let db = PageStore::open(&cli.database).await?;
    let history = HistoryStore::open(&cli.sessions_database).await?;
    let vector = VectorStore::new(
        &cli.qdrant_host,
        cli.qdrant_port,
        cli.qdrant_api_key.clone(),
    )?;
    let embedding = EmbeddingClient::new(&cli.embedding_base())?;
    let llm = LlmClient::new(&cli.llama_base_url, &cli.llama_model)?;

    // The crawler usually creates these, but the server may come up first.
    for collection in [PAGE_COLLECTION, PDF_COLLECTION] {
        if let Err(err) = vector.ensure_collection(collection).await {
            warn!(collection, error = %err, "could not ensure vector collection");
        }
    }

    let rag_config = RagConfig {
        max_results: cli.max_search_results,
        top_k: cli.rerank_top_k,
        ..RagConfig::default()
    };
    let rag = Arc::new(RagEngine::new(
        embedding.clone(),
        vector.clone(),
        history.clone(),
        llm.clone(),
        rag_config,
    ));

    let state = AppState {
        rag,
        history,
        db,
        vector,
        embedding,
        llm,
        started: Instant::now(),
        rate_limiter: SearchLimiter::new(cli.rate_limit_max_requests, cli.rate_limit_window_ms),
    };

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cli.bind, cli.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "archive API listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, stopping server");
        })
        .await
        .context("server shutdown")?;
    Ok(())
}
