//! Client for the black-box embedding service.
//!
//! The service exposes `POST /embed` taking `{"text": ...}` and
//! returning the vector plus its dimensionality.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ArchiveError, Result};

const EMBED_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Inputs longer than this are truncated before embedding.
const MAX_TEXT_CHARS: usize = 50_000;

/// A dense vector returned by the embedding service.
#[derive(Debug, Clone)]
pub struct Embedding {
    /// The vector values.
    pub vector: Vec<f32>,
    /// Dimensionality reported by the service.
    pub dims: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
    dims: usize,
    #[serde(default)]
    elapsed_ms: f32,
}

/// HTTP client for the embedding service.
#[derive(Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    embed_url: String,
    health_url: String,
}

impl EmbeddingClient {
    /// Builds a client for the service rooted at `base_url`.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base = base_url.trim_end_matches('/');
        let http = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .context("failed to build embedding HTTP client")?;
        Ok(Self {
            http,
            embed_url: format!("{base}/embed"),
            health_url: format!("{base}/health"),
        })
    }

    /// Embeds one text, truncating very long inputs.
    pub async fn embed(&self, text: &str) -> Result<Embedding> {
        let text = truncate_chars(text, MAX_TEXT_CHARS);
        if text.trim().is_empty() {
            return Err(ArchiveError::EmbedFailed("empty text".to_string()));
        }

        let response = self
            .http
            .post(&self.embed_url)
            .json(&EmbedRequest { text })
            .send()
            .await
            .map_err(|err| ArchiveError::EmbedFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ArchiveError::EmbedFailed(format!(
                "service returned {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|err| ArchiveError::EmbedFailed(format!("bad response: {err}")))?;
        debug!(
            dims = parsed.dims,
            service_ms = parsed.elapsed_ms,
            "embedding computed"
        );
        Ok(Embedding {
            vector: parsed.embedding,
            dims: parsed.dims,
        })
    }

    /// Embeds with up to `attempts` tries, sleeping `attempt²` seconds
    /// between failures. Cancellation aborts the backoff immediately.
    pub async fn embed_with_retry(
        &self,
        text: &str,
        attempts: usize,
        cancel: &CancellationToken,
    ) -> Result<Embedding> {
        let attempts = attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(ArchiveError::ShutdownRequested);
            }
            match self.embed(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "embedding attempt failed");
                    last_err = Some(err);
                }
            }
            if attempt < attempts {
                let backoff = Duration::from_secs((attempt * attempt) as u64);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ArchiveError::ShutdownRequested),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ArchiveError::EmbedFailed("no attempts made".to_string())))
    }

    /// Probes the service health endpoint.
    pub async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(&self.health_url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|err| ArchiveError::EmbedFailed(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ArchiveError::EmbedFailed(format!(
                "health returned {}",
                response.status()
            )))
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(10);
        assert_eq!(truncate_chars(&text, 4).chars().count(), 4);
        assert_eq!(truncate_chars(&text, 100), text.as_str());
    }

    #[test]
    fn embed_response_tolerates_missing_elapsed() {
        let parsed: EmbedResponse =
            serde_json::from_str(r#"{"embedding":[0.1,0.2],"dims":2}"#).unwrap();
        assert_eq!(parsed.embedding.len(), 2);
        assert_eq!(parsed.dims, 2);
    }
}
