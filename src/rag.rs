//! Streaming retrieval-augmented query pipeline: hybrid vector search,
//! group-wise PDF filtering, bounded context assembly, and token-level
//! streaming of the model answer.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::embedding::EmbeddingClient;
use crate::error::{ArchiveError, Result};
use crate::history::{ChatRole, HistoryStore, DEFAULT_HISTORY_LIMIT};
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::vector::{PagePayload, PdfPayload, ScoredPoint, VectorStore, PAGE_COLLECTION, PDF_COLLECTION};

/// Phrases that mark a query as continuing the previous turn.
const FOLLOW_UP_PATTERNS: &[&str] = &[
    "continue",
    "go on",
    "tell me more",
    "more details",
    "elaborate",
    "explain more",
    "keep going",
    "and then",
    "what else",
    "anything else",
    "more about",
    "expand on",
    "can you continue",
    "please continue",
    "more information",
    "tell me about that",
    "what about",
    "how about",
];

/// Answer emitted when retrieval produced nothing usable.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "I don't have sufficient relevant information to answer this.";

const SYSTEM_PROMPT: &str = "You are the assistant of a self-hosted web archive. \
    Answer questions using only the provided context from archived pages and PDF \
    documents. When the context does not cover the question, say so plainly.";

/// Tunable retrieval knobs.
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Per-collection result cap for hybrid search.
    pub max_results: usize,
    /// Documents kept after merge and re-rank.
    pub top_k: usize,
    /// Minimum score for a merged result to count as relevant.
    pub page_score_threshold: f32,
    /// Minimum best-chunk score for a PDF group to survive.
    pub pdf_score_threshold: f32,
    /// History messages loaded per query.
    pub history_limit: usize,
    /// Per-document character cap in the assembled context.
    pub doc_char_limit: usize,
    /// Total character cap of the assembled context.
    pub context_char_limit: usize,
    /// Below this many context characters the model is not invoked.
    pub min_context_chars: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            max_results: 15,
            top_k: 5,
            page_score_threshold: 0.5,
            pdf_score_threshold: 0.55,
            history_limit: DEFAULT_HISTORY_LIMIT,
            doc_char_limit: 1000,
            context_char_limit: 4000,
            min_context_chars: 100,
        }
    }
}

/// Events streamed back to the client, in order: `session`? `status`*
/// `sources` `token`* then exactly one `done` (or `error`).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Pipeline progress notice.
    Status(&'static str),
    /// A session was created for this query.
    Session {
        /// The new session's ID.
        session_id: String,
    },
    /// The ranked sources backing the answer.
    Sources(SourcesEvent),
    /// One content delta of the model answer.
    Token(String),
    /// The pipeline failed; the stream ends here.
    Error(String),
    /// The pipeline finished.
    Done {
        /// Wall time of the whole query.
        total_time_ms: u64,
    },
}

/// Payload of the `sources` event.
#[derive(Debug, Clone, Serialize)]
pub struct SourcesEvent {
    /// Number of sources selected.
    pub count: usize,
    /// The selected sources, best first.
    pub items: Vec<SourceItem>,
    /// Time spent embedding and searching.
    pub search_time_ms: u64,
}

/// One entry of the `sources` event.
#[derive(Debug, Clone, Serialize)]
pub struct SourceItem {
    /// `page` or `pdf`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Source URL.
    pub url: String,
    /// Display title.
    pub title: String,
    /// Similarity score.
    pub score: f32,
}

/// A merged search hit, page or PDF chunk.
#[derive(Debug, Clone)]
struct SearchDoc {
    kind: &'static str,
    url: String,
    title: String,
    content: String,
    score: f32,
}

/// The retrieval pipeline with its store handles.
#[derive(Clone)]
pub struct RagEngine {
    embedding: EmbeddingClient,
    vector: VectorStore,
    history: HistoryStore,
    llm: LlmClient,
    config: RagConfig,
}

impl RagEngine {
    /// Bundles the collaborators into an engine.
    pub fn new(
        embedding: EmbeddingClient,
        vector: VectorStore,
        history: HistoryStore,
        llm: LlmClient,
        config: RagConfig,
    ) -> Self {
        Self {
            embedding,
            vector,
            history,
            llm,
            config,
        }
    }

    /// Runs one query end to end, streaming events into `tx`. Internal
    /// failures become a single `error` event; the channel closing ends
    /// the work early.
    pub async fn search_stream(
        &self,
        user_query: &str,
        session_id: Option<String>,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let started = Instant::now();
        if let Err(err) = self.run_pipeline(user_query, session_id, &tx, started).await {
            let _ = tx.send(StreamEvent::Error(err.to_string())).await;
        }
    }

    async fn run_pipeline(
        &self,
        user_query: &str,
        session_id: Option<String>,
        tx: &mpsc::Sender<StreamEvent>,
        started: Instant,
    ) -> Result<()> {
        emit(tx, StreamEvent::Status("Loading...")).await?;

        let session_id = match session_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => {
                let id = self.history.create_session(None).await?;
                emit(
                    tx,
                    StreamEvent::Session {
                        session_id: id.clone(),
                    },
                )
                .await?;
                id
            }
        };

        let history = self
            .history
            .get_history(&session_id, self.config.history_limit)
            .await?;

        // A follow-up turn carries no topic of its own, so the previous
        // user question drives the search while the displayed query and
        // the stored message stay unchanged.
        let search_query = if is_follow_up(user_query) {
            match history
                .iter()
                .rev()
                .find(|entry| entry.role == ChatRole::User)
            {
                Some(previous) => {
                    debug!(query = user_query, replaced_by = %previous.content, "follow-up detected");
                    previous.content.clone()
                }
                None => user_query.to_string(),
            }
        } else {
            user_query.to_string()
        };

        emit(tx, StreamEvent::Status("Searching...")).await?;
        let search_started = Instant::now();
        let query_embedding = self.embedding.embed(&search_query).await?;

        let (pages, pdfs) = tokio::join!(
            self.vector.query::<PagePayload>(
                PAGE_COLLECTION,
                &query_embedding.vector,
                self.config.max_results,
                None,
            ),
            self.vector.query::<PdfPayload>(
                PDF_COLLECTION,
                &query_embedding.vector,
                self.config.max_results,
                None,
            ),
        );
        let pages = pages?;
        let pdfs = filter_pdf_groups(pdfs?, self.config.pdf_score_threshold);

        emit(tx, StreamEvent::Status("Filtering...")).await?;
        let selected = merge_and_rank(
            pages,
            pdfs,
            self.config.page_score_threshold,
            self.config.top_k,
        );
        let search_time_ms = search_started.elapsed().as_millis() as u64;

        let sources = SourcesEvent {
            count: selected.len(),
            items: selected
                .iter()
                .map(|doc| SourceItem {
                    kind: doc.kind,
                    url: doc.url.clone(),
                    title: doc.title.clone(),
                    score: doc.score,
                })
                .collect(),
            search_time_ms,
        };
        emit(tx, StreamEvent::Sources(sources.clone())).await?;

        let context = assemble_context(
            &selected,
            self.config.doc_char_limit,
            self.config.context_char_limit,
        );

        if context.content_chars < self.config.min_context_chars {
            debug!(chars = context.content_chars, "insufficient context, skipping model");
            emit(tx, StreamEvent::Token(INSUFFICIENT_CONTEXT_ANSWER.to_string())).await?;
            emit(
                tx,
                StreamEvent::Done {
                    total_time_ms: started.elapsed().as_millis() as u64,
                },
            )
            .await?;
            return Ok(());
        }

        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        for entry in &history {
            messages.push(match entry.role {
                ChatRole::User => ChatMessage::user(entry.content.clone()),
                ChatRole::Assistant => ChatMessage::assistant(entry.content.clone()),
            });
        }
        messages.push(ChatMessage::user(format!(
            "Context:\n{}\n\nQuestion: {user_query}\n\nProvide a helpful answer based on the context above:",
            context.formatted
        )));

        let answer = self.stream_answer(messages, tx).await?;

        if !answer.trim().is_empty() {
            let sources_blob = serde_json::to_value(&sources).ok();
            self.history
                .add_message(&session_id, ChatRole::User, user_query, None)
                .await?;
            self.history
                .add_message(
                    &session_id,
                    ChatRole::Assistant,
                    &answer,
                    sources_blob.as_ref(),
                )
                .await?;
        } else {
            warn!(%session_id, "model returned an empty answer, not persisting");
        }

        emit(
            tx,
            StreamEvent::Done {
                total_time_ms: started.elapsed().as_millis() as u64,
            },
        )
        .await?;
        Ok(())
    }

    /// Streams the model reply, forwarding each delta as a `token` event
    /// while the completion is still in flight.
    async fn stream_answer(
        &self,
        messages: Vec<ChatMessage>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<String> {
        let (token_tx, mut token_rx) = mpsc::unbounded_channel::<String>();
        let llm = self.llm.clone();
        let completion = tokio::spawn(async move {
            llm.chat_stream(&messages, ChatOptions::default(), move |token| {
                let _ = token_tx.send(token.to_string());
            })
            .await
        });

        while let Some(token) = token_rx.recv().await {
            if tx.send(StreamEvent::Token(token)).await.is_err() {
                completion.abort();
                return Err(ArchiveError::LlmStream("client went away".to_string()));
            }
        }

        completion
            .await
            .map_err(|err| ArchiveError::LlmStream(format!("stream task failed: {err}")))?
    }
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<()> {
    tx.send(event)
        .await
        .map_err(|_| ArchiveError::LlmStream("client went away".to_string()))
}

/// Classifies a query as a follow-up to the previous turn: either it
/// matches (equals or is a prefix of) a known continuation phrase, or it
/// is too terse to stand on its own.
fn is_follow_up(query: &str) -> bool {
    let normalized = query.trim().to_lowercase();
    if normalized.is_empty() {
        return false;
    }
    if FOLLOW_UP_PATTERNS
        .iter()
        .any(|phrase| phrase.starts_with(&normalized))
    {
        return true;
    }
    normalized.split_whitespace().count() <= 2 && normalized.chars().count() < 20
}

/// Keep-or-drop at PDF granularity: a group survives only when its best
/// chunk clears the threshold, and then every chunk of the group stays
/// so the document keeps its context.
fn filter_pdf_groups(
    hits: Vec<ScoredPoint<PdfPayload>>,
    threshold: f32,
) -> Vec<ScoredPoint<PdfPayload>> {
    let mut best: HashMap<String, f32> = HashMap::new();
    for hit in &hits {
        let entry = best.entry(hit.payload.pdf_url.clone()).or_insert(f32::MIN);
        if hit.score > *entry {
            *entry = hit.score;
        }
    }
    hits.into_iter()
        .filter(|hit| best.get(&hit.payload.pdf_url).copied().unwrap_or(f32::MIN) >= threshold)
        .collect()
}

/// Merges page and PDF hits, filters by score, and keeps the best
/// `top_k`. When nothing clears the bar, the best three of the raw
/// union are used instead.
fn merge_and_rank(
    pages: Vec<ScoredPoint<PagePayload>>,
    pdfs: Vec<ScoredPoint<PdfPayload>>,
    score_threshold: f32,
    top_k: usize,
) -> Vec<SearchDoc> {
    let mut all: Vec<SearchDoc> = Vec::with_capacity(pages.len() + pdfs.len());
    for hit in pages {
        all.push(SearchDoc {
            kind: "page",
            url: hit.payload.url,
            title: hit.payload.title,
            content: hit.payload.main_content,
            score: hit.score,
        });
    }
    for hit in pdfs {
        let title = hit
            .payload
            .pdf_url
            .rsplit('/')
            .next()
            .unwrap_or(&hit.payload.pdf_url)
            .to_string();
        all.push(SearchDoc {
            kind: "pdf",
            url: hit.payload.pdf_url,
            title,
            content: hit.payload.text_chunk,
            score: hit.score,
        });
    }
    all.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut selected: Vec<SearchDoc> = all
        .iter()
        .filter(|doc| doc.score >= score_threshold)
        .take(top_k)
        .cloned()
        .collect();
    if selected.is_empty() {
        selected = all.into_iter().take(3).collect();
    }
    selected
}

struct AssembledContext {
    formatted: String,
    content_chars: usize,
}

/// Assembles the prompt context: best documents first, each capped to
/// `doc_limit` characters, stopping before the running total would pass
/// `total_limit`.
fn assemble_context(docs: &[SearchDoc], doc_limit: usize, total_limit: usize) -> AssembledContext {
    let mut kept: Vec<(&SearchDoc, &str)> = Vec::new();
    let mut content_chars = 0usize;
    for doc in docs {
        let truncated = truncate_chars(&doc.content, doc_limit);
        let length = truncated.chars().count();
        if content_chars + length > total_limit {
            break;
        }
        content_chars += length;
        kept.push((doc, truncated));
    }

    let mut formatted = String::new();
    let pages: Vec<_> = kept.iter().filter(|(doc, _)| doc.kind == "page").collect();
    let pdfs: Vec<_> = kept.iter().filter(|(doc, _)| doc.kind == "pdf").collect();

    if !pages.is_empty() {
        formatted.push_str("=== Archived Pages ===\n");
        for (index, (doc, text)) in pages.iter().enumerate() {
            formatted.push_str(&format!(
                "[{}] {} ({})\n{}\n\n",
                index + 1,
                doc.title,
                doc.url,
                text
            ));
        }
    }
    if !pdfs.is_empty() {
        formatted.push_str("=== PDF Documents ===\n");
        for (index, (doc, text)) in pdfs.iter().enumerate() {
            formatted.push_str(&format!(
                "[{}] {} ({})\n{}\n\n",
                index + 1,
                doc.title,
                doc.url,
                text
            ));
        }
    }

    AssembledContext {
        formatted,
        content_chars,
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

    fn pdf_hit(pdf_url: &str, chunk_index: usize, score: f32) -> ScoredPoint<PdfPayload> {
        ScoredPoint {
            id: format!("{pdf_url}#{chunk_index}"),
            score,
            payload: PdfPayload {
                pdf_url: pdf_url.to_string(),
                pdf_path: "pdfs/x.pdf".to_string(),
                page_url: "https://a.test".to_string(),
                text_chunk: format!("chunk {chunk_index}"),
                chunk_index,
                timestamp: 0,
            },
        }
    }

    fn page_hit(url: &str, score: f32, content: &str) -> ScoredPoint<PagePayload> {
        ScoredPoint {
            id: url.to_string(),
            score,
            payload: PagePayload {
                url: url.to_string(),
                title: "Page".to_string(),
                main_content: content.to_string(),
                meta_description: String::new(),
                status_code: 200,
                outbound_links_count: 0,
                favicon: String::new(),
                image_alts: Vec::new(),
                headings: Vec::new(),
                word_count: 0,
                crawl_date: chrono::Utc::now(),
            },
        }
    }

    #[test]
    fn follow_up_phrases_match_exactly_or_as_prefix() {
        assert!(is_follow_up("continue"));
        assert!(is_follow_up("  Tell me more  "));
        assert!(is_follow_up("tell me mo"));
        assert!(!is_follow_up("continue reading later"));
    }

    #[test]
    fn terse_queries_are_follow_ups() {
        assert!(is_follow_up("why"));
        assert!(is_follow_up("and databases"));
        assert!(!is_follow_up("compare the two database engines"));
        // Two tokens but long enough to stand alone.
        assert!(!is_follow_up("elasticsearch benchmarking"));
    }

    #[test]
    fn pdf_group_keeps_all_chunks_when_one_clears_the_bar() {
        let hits = vec![
            pdf_hit("https://a.test/p1.pdf", 0, 0.61),
            pdf_hit("https://a.test/p1.pdf", 1, 0.42),
            pdf_hit("https://a.test/p1.pdf", 2, 0.40),
            pdf_hit("https://a.test/p2.pdf", 0, 0.52),
            pdf_hit("https://a.test/p2.pdf", 1, 0.51),
        ];
        let kept = filter_pdf_groups(hits, 0.55);
        assert_eq!(kept.len(), 3);
        assert!(kept.iter().all(|hit| hit.payload.pdf_url.ends_with("p1.pdf")));
    }

    #[test]
    fn merge_sorts_desc_and_caps_at_top_k() {
        let pages = vec![
            page_hit("https://a.test/1", 0.9, "one"),
            page_hit("https://a.test/2", 0.6, "two"),
            page_hit("https://a.test/3", 0.4, "three"),
        ];
        let pdfs = vec![pdf_hit("https://a.test/d.pdf", 0, 0.8)];
        let selected = merge_and_rank(pages, pdfs, 0.5, 2);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].url, "https://a.test/1");
        assert_eq!(selected[1].url, "https://a.test/d.pdf");
    }

    #[test]
    fn empty_filter_falls_back_to_top_three_unfiltered() {
        let pages = vec![
            page_hit("https://a.test/1", 0.45, "one"),
            page_hit("https://a.test/2", 0.40, "two"),
            page_hit("https://a.test/3", 0.30, "three"),
            page_hit("https://a.test/4", 0.20, "four"),
        ];
        let selected = merge_and_rank(pages, Vec::new(), 0.5, 5);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].url, "https://a.test/1");
    }

    #[test]
    fn context_respects_per_doc_and_total_caps() {
        let docs: Vec<SearchDoc> = (0..6)
            .map(|i| SearchDoc {
                kind: "page",
                url: format!("https://a.test/{i}"),
                title: format!("Doc {i}"),
                content: "x".repeat(1500),
                score: 1.0 - i as f32 * 0.05,
            })
            .collect();
        let context = assemble_context(&docs, 1000, 4000);
        // Four 1000-char documents fit exactly; the fifth would overflow.
        assert_eq!(context.content_chars, 4000);
        assert!(context.formatted.contains("Doc 0"));
        assert!(context.formatted.contains("Doc 3"));
        assert!(!context.formatted.contains("Doc 4"));
    }

    #[test]
    fn context_groups_pages_and_pdfs_under_markers() {
        let docs = vec![
            SearchDoc {
                kind: "pdf",
                url: "https://a.test/d.pdf".to_string(),
                title: "d.pdf".to_string(),
                content: "pdf text".to_string(),
                score: 0.9,
            },
            SearchDoc {
                kind: "page",
                url: "https://a.test/p".to_string(),
                title: "P".to_string(),
                content: "page text".to_string(),
                score: 0.8,
            },
        ];
        let context = assemble_context(&docs, 1000, 4000);
        assert!(context.formatted.contains("=== Archived Pages ==="));
        assert!(context.formatted.contains("=== PDF Documents ==="));
        let pages_pos = context.formatted.find("Archived Pages").unwrap();
        let pdf_pos = context.formatted.find("PDF Documents").unwrap();
        assert!(pages_pos < pdf_pos);
    }
}
