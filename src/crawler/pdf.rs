//! PDF pipeline: download, text extraction via `pdftotext`, chunking,
//! and chunk-by-chunk embedding into the vector store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{REFERER, USER_AGENT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::chunk_text;
use crate::crawler::extract::clean_content;
use crate::embedding::EmbeddingClient;
use crate::error::{ArchiveError, Result};
use crate::models::PdfData;
use crate::urls;
use crate::vector::{PdfPayload, VectorStore};

use super::media::write_capped;
use super::BOT_USER_AGENT;

/// Cap on downloaded PDF size.
const PDF_MAX_BYTES: usize = 50 * 1024 * 1024;

/// PDFs get a longer fetch deadline than pages.
const PDF_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Embedding attempts per chunk before the chunk is skipped.
const CHUNK_EMBED_ATTEMPTS: usize = 3;

/// Chunks shorter than this (trimmed) carry no useful signal.
const MIN_CHUNK_CHARS: usize = 50;

/// Everything the PDF pipeline needs, bundled so page crawling can spawn
/// PDF work onto background tasks.
pub struct PdfPipeline {
    http: reqwest::Client,
    pdfs_dir: PathBuf,
    embedding: EmbeddingClient,
    vector: VectorStore,
    cancel: CancellationToken,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl PdfPipeline {
    /// Builds a pipeline writing into `pdfs_dir`.
    pub fn new(
        http: reqwest::Client,
        pdfs_dir: PathBuf,
        embedding: EmbeddingClient,
        vector: VectorStore,
        cancel: CancellationToken,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            http,
            pdfs_dir,
            embedding,
            vector,
            cancel,
            chunk_size,
            chunk_overlap,
        }
    }

    /// Downloads a PDF, extracts and embeds its text. The caller must
    /// have claimed the URL already so each PDF is processed at most once.
    pub async fn process(&self, pdf_url: &str, page_url: &str) -> Result<PdfData> {
        let local_path = self.download(pdf_url, page_url).await?;

        let text = match self.extract_text(&local_path).await {
            Ok(text) => text,
            Err(err) => {
                warn!(pdf_url, error = %err, "text extraction failed, continuing without text");
                String::new()
            }
        };
        let text = clean_content(&text);

        let file_size = tokio::fs::metadata(&local_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let pdf = PdfData {
            url: pdf_url.to_string(),
            local_path: local_path.display().to_string(),
            text,
            file_size,
        };

        if !pdf.text.is_empty() {
            match self.embed_chunks(&pdf, page_url).await {
                Ok(stored) => info!(pdf_url, stored, "pdf chunks embedded"),
                Err(err) => warn!(pdf_url, error = %err, "pdf embedding failed"),
            }
        } else {
            debug!(pdf_url, "pdf has no text, skipping embedding");
        }

        Ok(pdf)
    }

    /// Fetches the PDF into `pdfs_dir` under its SHA-256 basename.
    /// Idempotent when the file already exists.
    async fn download(&self, pdf_url: &str, referer: &str) -> Result<PathBuf> {
        let basename = format!("{}.pdf", urls::file_basename_stem(pdf_url));
        let destination = self.pdfs_dir.join(&basename);

        if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            debug!(path = %destination.display(), "pdf already downloaded");
            return Ok(destination);
        }

        let response = self
            .http
            .get(pdf_url)
            .timeout(PDF_FETCH_TIMEOUT)
            .header(USER_AGENT, BOT_USER_AGENT)
            .header(REFERER, referer)
            .send()
            .await
            .map_err(|err| ArchiveError::FetchFailed {
                url: pdf_url.to_string(),
                reason: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ArchiveError::FetchFailed {
                url: pdf_url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        if !content_type.contains("pdf") {
            return Err(ArchiveError::SkippedContent(format!(
                "not a pdf content type: {content_type}"
            )));
        }

        write_capped(response, &destination, PDF_MAX_BYTES, pdf_url).await?;
        debug!(pdf_url, path = %destination.display(), "pdf downloaded");
        Ok(destination)
    }

    /// Runs `pdftotext -layout` and reads the sibling text file it
    /// produces. The text file is removed afterwards.
    async fn extract_text(&self, pdf_path: &Path) -> Result<String> {
        let output_path = PathBuf::from(format!("{}.txt", pdf_path.display()));

        let status = tokio::process::Command::new("pdftotext")
            .arg("-layout")
            .arg(pdf_path)
            .arg(&output_path)
            .status()
            .await
            .map_err(|err| {
                ArchiveError::ExtractorFailed(format!(
                    "pdftotext unavailable (install poppler-utils): {err}"
                ))
            })?;
        if !status.success() {
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(ArchiveError::ExtractorFailed(format!(
                "pdftotext exited with {status}"
            )));
        }

        let text = tokio::fs::read_to_string(&output_path)
            .await
            .map_err(|err| ArchiveError::ExtractorFailed(format!("read extracted text: {err}")))?;
        let _ = tokio::fs::remove_file(&output_path).await;
        Ok(text)
    }

    /// Replaces the PDF's chunk set in the vector store, embedding chunks
    /// in order. A chunk whose embedding keeps failing is skipped; the
    /// surviving chunks are indexed contiguously from zero.
    async fn embed_chunks(&self, pdf: &PdfData, page_url: &str) -> Result<usize> {
        let chunks: Vec<String> = chunk_text(&pdf.text, self.chunk_size, self.chunk_overlap)
            .into_iter()
            .filter(|chunk| chunk.trim().chars().count() >= MIN_CHUNK_CHARS)
            .collect();
        if chunks.is_empty() {
            return Ok(0);
        }
        debug!(pdf_url = %pdf.url, chunks = chunks.len(), "embedding pdf chunks");

        // Old points for this PDF go away first so the stored chunk set
        // stays contiguous across re-crawls.
        if let Err(err) = self.vector.delete_pdf_chunks(&pdf.url).await {
            warn!(pdf_url = %pdf.url, error = %err, "stale chunk cleanup failed");
        }

        let mut stored = 0usize;
        for chunk in &chunks {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::ShutdownRequested);
            }
            let embedding = match self
                .embedding
                .embed_with_retry(chunk, CHUNK_EMBED_ATTEMPTS, &self.cancel)
                .await
            {
                Ok(embedding) => embedding,
                Err(ArchiveError::ShutdownRequested) => {
                    return Err(ArchiveError::ShutdownRequested)
                }
                Err(err) => {
                    warn!(pdf_url = %pdf.url, error = %err, "chunk embedding failed, skipping");
                    continue;
                }
            };

            let payload = PdfPayload {
                pdf_url: pdf.url.clone(),
                pdf_path: pdf.local_path.clone(),
                page_url: page_url.to_string(),
                text_chunk: chunk.clone(),
                chunk_index: stored,
                timestamp: Utc::now().timestamp(),
            };
            match self.vector.upsert_pdf_chunk(&payload, &embedding.vector).await {
                Ok(()) => stored += 1,
                Err(err) => {
                    warn!(pdf_url = %pdf.url, error = %err, "chunk upsert failed, skipping");
                }
            }
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_chunks_are_filtered_before_indexing() {
        let text = format!(
            "{} short",
            "meaningful content word ".repeat(20).trim()
        );
        let chunks: Vec<String> = chunk_text(&text, 50, 5)
            .into_iter()
            .filter(|chunk| chunk.trim().chars().count() >= MIN_CHUNK_CHARS)
            .collect();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.trim().chars().count() >= MIN_CHUNK_CHARS));
    }
}
