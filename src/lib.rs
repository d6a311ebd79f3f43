#![warn(missing_docs)]
//! Self-hosted archival and retrieval engine.
//!
//! The crawler side walks allow-listed origins, extracts page content,
//! downloads images and PDFs, and persists into a relational store plus
//! a vector store. The retrieval side answers natural-language questions
//! over the archive with hybrid vector search and a streaming model
//! answer.

pub mod chunk;
pub mod crawler;
pub mod db;
pub mod embedding;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod rag;
pub mod robots;
pub mod server;
pub mod sitemap;
pub mod telemetry;
pub mod urls;
pub mod vector;

pub use crawler::{CrawlConfig, Crawler, BOT_USER_AGENT};
pub use db::PageStore;
pub use embedding::EmbeddingClient;
pub use error::{ArchiveError, Result};
pub use history::HistoryStore;
pub use llm::LlmClient;
pub use rag::{RagConfig, RagEngine};
pub use vector::VectorStore;
