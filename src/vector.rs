//! Qdrant-backed vector store client speaking the REST API.
//!
//! Both collections hold 384-dim cosine vectors. Page points are keyed by
//! the deterministic URL ID so re-crawls overwrite in place; PDF chunk
//! points get random IDs and are addressed through payload filters.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ArchiveError, Result};
use crate::models::PageData;
use crate::urls;

/// Collection holding one point per archived page.
pub const PAGE_COLLECTION: &str = "page_content_embeddings";
/// Collection holding one point per PDF text chunk.
pub const PDF_COLLECTION: &str = "pdf_content_embeddings";
/// Dimensionality of both collections.
pub const VECTOR_DIMS: usize = 384;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Payload stored with a page point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagePayload {
    /// Page URL (trailing slash stripped).
    pub url: String,
    /// Page title.
    pub title: String,
    /// Readable body text that was embedded.
    pub main_content: String,
    /// Meta description.
    pub meta_description: String,
    /// HTTP status of the crawl fetch.
    pub status_code: u16,
    /// Number of outbound links found on the page.
    pub outbound_links_count: usize,
    /// Favicon URL.
    pub favicon: String,
    /// Alt texts of page images.
    pub image_alts: Vec<String>,
    /// Flattened heading texts.
    pub headings: Vec<String>,
    /// Word count of the body text.
    pub word_count: usize,
    /// When the page was crawled.
    pub crawl_date: DateTime<Utc>,
}

impl PagePayload {
    /// Builds the payload for a page about to be upserted.
    pub fn from_page(page: &PageData) -> Self {
        Self {
            url: page.url.clone(),
            title: page.title.clone(),
            main_content: page.main_content.clone(),
            meta_description: page.meta_description.clone(),
            status_code: page.status_code,
            outbound_links_count: page.outbound_links.len(),
            favicon: page.favicon.clone(),
            image_alts: page.image_alt.clone(),
            headings: page.heading_list(),
            word_count: page.word_count,
            crawl_date: page.crawl_date,
        }
    }
}

/// Payload stored with a PDF chunk point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfPayload {
    /// URL of the PDF document.
    pub pdf_url: String,
    /// Local path of the downloaded PDF.
    pub pdf_path: String,
    /// URL of the page that linked to the PDF.
    pub page_url: String,
    /// Text of this chunk.
    pub text_chunk: String,
    /// Position of the chunk within the PDF, contiguous from 0.
    pub chunk_index: usize,
    /// Unix timestamp of the upsert.
    pub timestamp: i64,
}

/// A search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredPoint<P> {
    /// Point ID as stored in the collection.
    pub id: String,
    /// Cosine similarity score.
    pub score: f32,
    /// Typed payload.
    pub payload: P,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<RawScoredPoint>,
}

#[derive(Deserialize)]
struct RawScoredPoint {
    id: serde_json::Value,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct ScrollResponse {
    result: ScrollResult,
}

#[derive(Deserialize)]
struct ScrollResult {
    #[serde(default)]
    points: Vec<RawScoredPoint>,
}

#[derive(Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfo,
}

#[derive(Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: u64,
}

/// REST client for the vector store.
#[derive(Clone)]
pub struct VectorStore {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl VectorStore {
    /// Builds a client for a Qdrant instance.
    pub fn new(host: &str, port: u16, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .context("failed to build vector store HTTP client")?;
        Ok(Self {
            http,
            base_url: format!("http://{host}:{port}"),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|err| ArchiveError::VectorStore(format!("{what}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArchiveError::VectorStore(format!(
                "{what}: status {status}: {body}"
            )));
        }
        Ok(response)
    }

    /// Creates a 384-dim cosine collection when it does not exist yet.
    pub async fn ensure_collection(&self, name: &str) -> Result<()> {
        let exists = self
            .request(reqwest::Method::GET, &format!("/collections/{name}"))
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false);
        if exists {
            return Ok(());
        }

        let body = json!({
            "vectors": { "size": VECTOR_DIMS, "distance": "Cosine" }
        });
        self.send(
            self.request(reqwest::Method::PUT, &format!("/collections/{name}"))
                .json(&body),
            "create collection",
        )
        .await?;
        debug!(collection = name, "vector collection created");
        Ok(())
    }

    /// Upserts the page point, keyed by the deterministic URL ID.
    pub async fn upsert_page(&self, page: &PageData, vector: &[f32]) -> Result<()> {
        let payload = PagePayload::from_page(page);
        let point_id = urls::deterministic_id(&page.url);
        self.upsert_point(PAGE_COLLECTION, &point_id, vector, &payload)
            .await
    }

    /// Upserts a PDF chunk point under a fresh random ID.
    pub async fn upsert_pdf_chunk(&self, payload: &PdfPayload, vector: &[f32]) -> Result<()> {
        let point_id = Uuid::new_v4().to_string();
        self.upsert_point(PDF_COLLECTION, &point_id, vector, payload)
            .await
    }

    async fn upsert_point<P: Serialize>(
        &self,
        collection: &str,
        point_id: &str,
        vector: &[f32],
        payload: &P,
    ) -> Result<()> {
        let body = json!({
            "points": [{
                "id": point_id,
                "vector": vector,
                "payload": payload,
            }]
        });
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&body),
            "upsert point",
        )
        .await?;
        Ok(())
    }

    /// Nearest-neighbor query returning typed payloads. Points whose
    /// payload does not match the expected shape are dropped.
    pub async fn query<P: DeserializeOwned>(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint<P>>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(threshold) = score_threshold {
            body["score_threshold"] = json!(threshold);
        }
        let response = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points/search"),
                )
                .json(&body),
                "search",
            )
            .await?;
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|err| ArchiveError::VectorStore(format!("search decode: {err}")))?;
        Ok(typed_points(parsed.result))
    }

    /// Scrolls every PDF chunk that was discovered on the given page.
    pub async fn scroll_pdfs_by_page(
        &self,
        page_url: &str,
        limit: usize,
    ) -> Result<Vec<PdfPayload>> {
        let body = json!({
            "filter": { "must": [{ "key": "page_url", "match": { "value": page_url } }] },
            "limit": limit,
            "with_payload": true,
        });
        let response = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{PDF_COLLECTION}/points/scroll"),
                )
                .json(&body),
                "scroll",
            )
            .await?;
        let parsed: ScrollResponse = response
            .json()
            .await
            .map_err(|err| ArchiveError::VectorStore(format!("scroll decode: {err}")))?;
        Ok(typed_points(parsed.result.points)
            .into_iter()
            .map(|point: ScoredPoint<PdfPayload>| point.payload)
            .collect())
    }

    /// Deletes every chunk point belonging to a PDF URL.
    pub async fn delete_pdf_chunks(&self, pdf_url: &str) -> Result<()> {
        let body = json!({
            "filter": { "must": [{ "key": "pdf_url", "match": { "value": pdf_url } }] }
        });
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{PDF_COLLECTION}/points/delete?wait=true"),
            )
            .json(&body),
            "delete points",
        )
        .await?;
        Ok(())
    }

    /// Number of points currently stored in a collection.
    pub async fn points_count(&self, collection: &str) -> Result<u64> {
        let response = self
            .send(
                self.request(reqwest::Method::GET, &format!("/collections/{collection}")),
                "collection info",
            )
            .await?;
        let parsed: CollectionInfoResponse = response
            .json()
            .await
            .map_err(|err| ArchiveError::VectorStore(format!("info decode: {err}")))?;
        Ok(parsed.result.points_count)
    }

    /// Probes the store by listing collections.
    pub async fn health(&self) -> Result<()> {
        self.send(
            self.request(reqwest::Method::GET, "/collections"),
            "health",
        )
        .await?;
        Ok(())
    }
}

fn typed_points<P: DeserializeOwned>(raw: Vec<RawScoredPoint>) -> Vec<ScoredPoint<P>> {
    raw.into_iter()
        .filter_map(|point| {
            let id = match &point.id {
                serde_json::Value::String(id) => id.clone(),
                other => other.to_string(),
            };
            match serde_json::from_value::<P>(point.payload) {
                Ok(payload) => Some(ScoredPoint {
                    id,
                    score: point.score,
                    payload,
                }),
                Err(err) => {
                    warn!(%id, error = %err, "dropping point with malformed payload");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_payload_mirrors_page_data() {
        let mut page = PageData::new("https://a.test/article");
        page.title = "Article".to_string();
        page.main_content = "body text here".to_string();
        page.refresh_word_count();
        page.outbound_links.push(crate::models::Link::bare("https://a.test/other"));
        page.image_alt.push("diagram".to_string());
        page.headings
            .insert("h1".to_string(), vec!["Article".to_string()]);

        let payload = PagePayload::from_page(&page);
        assert_eq!(payload.url, "https://a.test/article");
        assert_eq!(payload.outbound_links_count, 1);
        assert_eq!(payload.word_count, 3);
        assert_eq!(payload.headings, vec!["Article"]);
        assert_eq!(payload.image_alts, vec!["diagram"]);
    }

    #[test]
    fn search_response_decodes_typed_payloads() {
        let raw = r#"{
            "result": [
                {"id": "abc", "score": 0.91, "payload": {
                    "pdf_url": "https://a.test/doc.pdf", "pdf_path": "pdfs/x.pdf",
                    "page_url": "https://a.test", "text_chunk": "hello",
                    "chunk_index": 0, "timestamp": 1700000000
                }},
                {"id": "broken", "score": 0.5, "payload": {"nope": true}}
            ]
        }"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        let points: Vec<ScoredPoint<PdfPayload>> = typed_points(parsed.result);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].payload.chunk_index, 0);
        assert!((points[0].score - 0.91).abs() < f32::EPSILON);
    }

    #[test]
    fn numeric_point_ids_survive() {
        let raw = r#"{"result":[{"id": 7, "score": 0.4, "payload": {
            "pdf_url": "u", "pdf_path": "p", "page_url": "g",
            "text_chunk": "t", "chunk_index": 2, "timestamp": 1
        }}]}"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        let points: Vec<ScoredPoint<PdfPayload>> = typed_points(parsed.result);
        assert_eq!(points[0].id, "7");
        assert_eq!(points[0].payload.chunk_index, 2);
    }
}
